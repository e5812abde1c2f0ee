use camino::Utf8PathBuf;
use indicatif::ProgressStyle;

use crate::data::{Dataset, Record};

/// Installs the default subscriber: `RUST_LOG` filtering (default `info`),
/// formatted output routed through the progress bars.
///
/// Does nothing when a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init();
}

/// Spinner style for a single chunk job.
pub(crate) fn get_style_task() -> Option<ProgressStyle> {
    ProgressStyle::with_template("{span_child_prefix}{spinner:.blue} {msg} [{elapsed}]").ok()
}

/// Writes the samples of a failed fit to the system temp directory for
/// inspection. The file is named after the hash of its content, so repeated
/// failures on the same group do not pile up.
pub(crate) fn dump_group<R: Record>(task: &str, group: &str, data: &Dataset<R>) -> Option<Utf8PathBuf> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    let mut write = || -> Result<Vec<u8>, csv::Error> {
        writer.write_record(R::COLUMNS.iter().map(|(name, _)| *name))?;
        for row in data {
            writer.write_record(row.to_row().iter().map(ToString::to_string))?;
        }
        writer.flush()?;
        Ok(writer.get_ref().clone())
    };

    let bytes = match write() {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(task, group, "Couldn't serialize failed group: {err}");
            return None;
        }
    };

    let hash = blake3::hash(&bytes).to_hex();
    let dir = Utf8PathBuf::from_path_buf(std::env::temp_dir()).ok()?;
    let path = dir.join(format!("{task}-{}.csv", &hash[..16]));

    match std::fs::write(&path, bytes) {
        Ok(()) => Some(path),
        Err(err) => {
            tracing::warn!(task, group, "Couldn't write failed group to {path}: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SqlType;

    crate::record! {
        struct Sample {
            index: [id, n],
            station: id,
            id: String => SqlType::Text,
            n: u32 => SqlType::Integer,
            prcp: f64 => SqlType::Real,
        }
    }

    #[test]
    fn test_dump_group_is_content_addressed() {
        let data = Dataset::new(vec![
            Sample { id: "ST1".into(), n: 0, prcp: 1.5 },
            Sample { id: "ST1".into(), n: 1, prcp: f64::NAN },
        ]);

        let a = dump_group("prcp", "ST1/1", &data).unwrap();
        let b = dump_group("prcp", "ST1/1", &data).unwrap();
        assert_eq!(a, b);

        let text = std::fs::read_to_string(&a).unwrap();
        assert_eq!(text, "id,n,prcp\nST1,0,1.5\nST1,1,\n");
        let _ = std::fs::remove_file(a);
    }
}
