use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::registry::{Execution, Plan};

/// Timing of one chunk job.
#[derive(Debug, Clone)]
pub struct ChunkExecution {
    pub index: usize,
    pub stations: usize,
    pub start: Instant,
    pub duration: Duration,
}

/// Performance metrics of a materialization.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// One entry per chunk, in chunk order.
    pub chunks: Vec<ChunkExecution>,
    /// Time spent per task, summed over all chunks and the merge.
    pub task_times: HashMap<&'static str, Duration>,
}

/// Green at `t = 0`, yellow at `t = 0.5`, red at `t = 1`.
fn heat(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

impl Diagnostics {
    /// Total time spent across all chunks.
    pub fn busy_time(&self) -> Duration {
        self.chunks.iter().map(|chunk| chunk.duration).sum()
    }

    /// Renders the plan as a Mermaid diagram, tasks colored by their share of
    /// the total task time.
    pub fn render_mermaid(&self, plan: &Plan) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let (min, max) = self
            .task_times
            .values()
            .map(Duration::as_secs_f64)
            .fold((f64::MAX, f64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));
        let span = if max > min { max - min } else { 1.0 };

        for (index, descriptor) in plan.descriptors().enumerate() {
            let name = descriptor.name.replace('"', "\\\"");
            let (label, color) = match self.task_times.get(descriptor.name) {
                Some(time) => (
                    format!("{time:.2?}"),
                    heat((time.as_secs_f64() - min) / span),
                ),
                None => ("Skipped".to_string(), "#ADD8E6".to_string()),
            };

            let marker = match descriptor.execution {
                Execution::PerChunk => "",
                Execution::Deferred => " (deferred)",
            };
            let _ = writeln!(f, "    {index}[\"{name}{marker}\\n{label}\"]");
            let _ = writeln!(f, "    style {index} fill:{color}");
            if descriptor.has_run_step {
                let _ = writeln!(f, "    {index} --> Namelist");
            }
        }

        let _ = writeln!(f, "    Namelist[Namelist]");

        for (index, descriptor) in plan.descriptors().enumerate() {
            for prerequisite in &descriptor.prerequisites {
                if let Some(source) = plan.position(prerequisite) {
                    let _ = writeln!(f, "    {source} --> {index}");
                }
            }
        }

        f
    }

    /// Renders a waterfall chart of the chunk jobs as an SVG string.
    pub fn render_waterfall(&self) -> String {
        const ROW: u32 = 30;
        const LABEL: u32 = 200;
        const CHART: u32 = 800;
        const HEADER: u32 = 30;

        let Some(global_start) = self.chunks.iter().map(|c| c.start).min() else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No chunks ran</text></svg>"#.to_string();
        };
        let global_end = self
            .chunks
            .iter()
            .map(|c| c.start + c.duration)
            .max()
            .unwrap_or(global_start);
        let total = global_end.duration_since(global_start).as_micros().max(1) as f64;

        let height = HEADER + self.chunks.len() as u32 * ROW + 10;
        let mut svg = String::with_capacity(self.chunks.len() * 400);
        let _ = write!(
            svg,
            r#"<svg width="{}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }} .time {{ fill: #666; font-size: 11px; }}</style><rect width="100%" height="100%" fill="white" />"#,
            LABEL + CHART + 110,
        );

        for (row, chunk) in self.chunks.iter().enumerate() {
            let y = HEADER + row as u32 * ROW;
            let offset = chunk.start.duration_since(global_start).as_micros() as f64;
            let width = chunk.duration.as_micros() as f64;
            let x = LABEL as f64 + 10.0 + offset / total * CHART as f64;
            let w = (width / total * CHART as f64).max(1.0);

            let _ = write!(
                svg,
                r#"<text x="10" y="{}" dominant-baseline="middle">chunk {} ({} stations)</text>"#,
                y + ROW / 2,
                chunk.index,
                chunk.stations
            );
            let _ = write!(
                svg,
                r#"<rect x="{x:.1}" y="{}" width="{w:.1}" height="{}" class="bar" />"#,
                y + 5,
                ROW - 10
            );
            let _ = write!(
                svg,
                r#"<text x="{:.1}" y="{}" class="time" dominant-baseline="middle">{:.2?}</text>"#,
                x + w + 5.0,
                y + ROW / 2,
                chunk.duration
            );
        }

        svg.push_str("</svg>");
        svg
    }

    pub fn render_waterfall_to_file(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        std::fs::write(path, self.render_waterfall())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heat_scale() {
        assert_eq!(heat(0.0), "#00FF00");
        assert_eq!(heat(0.5), "#FFFF00");
        assert_eq!(heat(1.0), "#FF0000");
    }

    #[test]
    fn test_waterfall_rows() {
        let start = Instant::now();
        let diagnostics = Diagnostics {
            chunks: (0..3)
                .map(|index| ChunkExecution {
                    index,
                    stations: 2,
                    start,
                    duration: Duration::from_millis(5 * (index as u64 + 1)),
                })
                .collect(),
            ..Default::default()
        };

        let svg = diagnostics.render_waterfall();
        assert_eq!(svg.matches("class=\"bar\"").count(), 3);
        assert!(svg.contains("chunk 2 (2 stations)"));
        assert_eq!(diagnostics.busy_time(), Duration::from_millis(30));
        assert!(Diagnostics::default().render_waterfall().contains("No chunks ran"));
    }
}
