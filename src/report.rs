// Quantization error as bit-width grows, per method
use std::path::Path;

use plotters::prelude::*;

use crate::config::QuantMethod;
use crate::error::{QuantError, Result};
use crate::quantization::quantize_with;
use crate::tensor::Tensor;

/// Floor for the log-scaled axis; exact reconstructions would otherwise sit at zero.
const MIN_PLOTTED_ERROR: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorSeries {
    pub method: QuantMethod,
    /// `(bits, mean squared error)`
    pub points: Vec<(u32, f64)>,
}

pub fn mean_squared_error(a: &Tensor, b: &Tensor) -> Result<f64> {
    if a.shape() != b.shape() {
        return Err(QuantError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    if a.is_empty() {
        return Ok(0.0);
    }
    let n = a.len() as f64;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (f64::from(x) - f64::from(y)).powi(2))
        .sum::<f64>()
        / n)
}

/// Fake-quantizes `tensor` with every method at every width in `bits`.
pub fn error_by_bits(tensor: &Tensor, methods: &[QuantMethod], bits: &[u32]) -> Result<Vec<ErrorSeries>> {
    methods
        .iter()
        .map(|&method| {
            let points = bits
                .iter()
                .map(|&b| {
                    let quantized = quantize_with(tensor, method, b, 0.0);
                    Ok((b, mean_squared_error(tensor, &quantized)?))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ErrorSeries { method, points })
        })
        .collect()
}

pub fn plot_error_by_bits(series: &[ErrorSeries], path: &Path) -> Result<()> {
    draw(series, path).map_err(|e| QuantError::Plot(e.to_string()))
}

fn draw(series: &[ErrorSeries], path: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let bits = series.iter().flat_map(|s| s.points.iter().map(|(b, _)| *b));
    let x_min = bits.clone().min().unwrap_or(1) as f64;
    let x_max = bits.max().unwrap_or(8).max(x_min as u32 + 1) as f64;
    let errors = series
        .iter()
        .flat_map(|s| s.points.iter().map(|(_, e)| e.max(MIN_PLOTTED_ERROR)));
    let y_min = errors.clone().fold(f64::INFINITY, f64::min).min(1.0);
    let y_max = errors.fold(MIN_PLOTTED_ERROR, f64::max) * 10.0;

    let mut chart = ChartBuilder::on(&root)
        .caption("MSE vs. Bit Width", ("sans-serif", 40).into_font())
        .margin(30)
        .x_label_area_size(50)
        .y_label_area_size(75)
        .build_cartesian_2d(x_min..x_max, (y_min..y_max).log_scale())?;

    chart
        .configure_mesh()
        .x_desc("Bits")
        .y_desc("Mean Squared Error (MSE)")
        .light_line_style(&WHITE.mix(0.8))
        .draw()?;

    for (i, s) in series.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        let points: Vec<(f64, f64)> = s
            .points
            .iter()
            .map(|&(b, e)| (b as f64, e.max(MIN_PLOTTED_ERROR)))
            .collect();

        chart
            .draw_series(LineSeries::new(points.iter().cloned(), &color))?
            .label(s.method.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x - 5, y), (x + 5, y)], &color));
        chart.draw_series(points.iter().map(|&(x, y)| Circle::new((x, y), 3, color.filled())))?;
    }

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}
