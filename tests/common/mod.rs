// tests/common/mod.rs
use anyhow::Result;
use std::io::Write;
use tempfile::NamedTempFile;

pub const FULL_CONFIGURATION: &str = r#"
[broker]
address = "localhost:9092"
topic = "ccx.ocp.results"
group = "kafka-monitor"
timeout = "30s"

[output]
verbose = true

[client]
auto_offset_reset = "earliest"
claim_buffer_size = 64

[client.properties]
"statistics.interval.ms" = "0"
"#;

/// Write `contents` to a temporary TOML file that lives as long as the handle
pub fn write_config(contents: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}
