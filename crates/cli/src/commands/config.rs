//! Config command - print the effective configuration

use anyhow::Result;
use siprtsp_media_bridge::BridgeConfig;

pub fn execute(config: &BridgeConfig) -> Result<()> {
    println!("{}", config.to_json()?);
    Ok(())
}
