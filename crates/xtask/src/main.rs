//! Dev-only helper: dump the JSON Schema for `TestConfig` so it can be
//! checked into docs or fed to an editor's YAML language server.

use anyhow::Context;
use proxybench_core::TestConfig;

fn main() -> anyhow::Result<()> {
    let out_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.schema.json".to_string());

    let schema = schemars::schema_for!(TestConfig);
    let json = serde_json::to_string_pretty(&schema).context("serialising schema")?;
    fs_err::write(&out_path, json).with_context(|| format!("writing schema to {out_path}"))?;

    println!("wrote schema to {out_path}");
    Ok(())
}
