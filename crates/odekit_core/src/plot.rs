//! Named curves on a shared axis, rendered to a standalone HTML page.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    pub name: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub curves: Vec<Curve>,
}

impl Figure {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn x_label(mut self, label: impl Into<String>) -> Self {
        self.x_label = label.into();
        self
    }

    pub fn y_label(mut self, label: impl Into<String>) -> Self {
        self.y_label = label.into();
        self
    }

    pub fn add_named_curve(
        &mut self,
        x: Vec<f64>,
        y: Vec<f64>,
        name: impl Into<String>,
    ) -> Result<&mut Self> {
        let name = name.into();
        if name.trim().is_empty() {
            bail!("Curve name must not be empty.");
        }
        if x.len() != y.len() {
            bail!(
                "Curve '{}' has {} x values but {} y values.",
                name,
                x.len(),
                y.len()
            );
        }
        self.curves.push(Curve { name, x, y });
        Ok(self)
    }

    pub fn curve(&self, name: &str) -> Option<&Curve> {
        self.curves.iter().find(|c| c.name == name)
    }
}

#[cfg(feature = "html")]
mod html {
    use super::Figure;
    use anyhow::{Context, Result};
    use plotly::common::Mode;
    use plotly::layout::{Axis, Layout};
    use plotly::{Plot, Scatter};
    use std::path::Path;

    impl Figure {
        fn to_plot(&self) -> Plot {
            let mut plot = Plot::new();
            for curve in &self.curves {
                let trace = Scatter::new(curve.x.clone(), curve.y.clone())
                    .mode(Mode::Lines)
                    .name(curve.name.as_str());
                plot.add_trace(trace);
            }
            let layout = Layout::new()
                .title(self.title.as_str())
                .x_axis(Axis::new().title(self.x_label.as_str()))
                .y_axis(Axis::new().title(self.y_label.as_str()));
            plot.set_layout(layout);
            plot
        }

        /// Renders an HTML fragment with the plot in a div named `div_id`.
        pub fn render_html(&self, div_id: &str) -> String {
            self.to_plot().to_inline_html(Some(div_id))
        }

        /// Writes a standalone HTML page.
        pub fn write_html(&self, path: impl AsRef<Path>) -> Result<()> {
            let path = path.as_ref();
            std::fs::write(path, self.to_plot().to_html())
                .with_context(|| format!("Failed to write figure to {}", path.display()))
        }
    }
}
