use std::fs;
use std::path::Path;

use anyhow::Context;
use plotly::common::color::Rgb;
use plotly::common::{Marker, Mode, Title};
use plotly::layout::{Axis, Layout};
use plotly::{Plot, Scatter};

use crate::sim::LoadReport;

/// Writes an HTML chart comparing admitted requests with and without the bucket.
pub fn chart(report: &LoadReport, title: &str, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let seconds: Vec<usize> = (0..report.without_bucket.len()).collect();
    let trace1 = Scatter::new(seconds.clone(), report.with_bucket.clone())
        .mode(Mode::LinesMarkers)
        .name("With Token Bucket")
        .marker(Marker::new().color(Rgb::new(219, 64, 82)).size(12));
    let trace2 = Scatter::new(seconds, report.without_bucket.clone())
        .mode(Mode::LinesMarkers)
        .name("Without Token Bucket")
        .marker(Marker::new().color(Rgb::new(128, 0, 128)).size(12));

    let layout = Layout::new()
        .title(Title::new(title))
        .x_axis(
            Axis::new()
                .title(Title::new("Elapsed (s)"))
                .tick_format(".0f"),
        )
        .y_axis(Axis::new().title(Title::new("Admitted Requests")));

    let mut plot = Plot::new();
    plot.add_trace(trace1);
    plot.add_trace(trace2);
    plot.set_layout(layout);
    let path = path.as_ref();
    fs::write(path, plot.to_html())
        .with_context(|| format!("Unable to write chart to {}", path.display()))
}
