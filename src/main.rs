use anyhow::Context;
use tracing::info;

use order_geocoder::{init_tracing, update_geo_json, AppConfig, GeocoderContext, UpdateGeoJsonFlags};

fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    let flags = UpdateGeoJsonFlags::from_env();
    info!(config = ?config.public_profile(), ?flags, "starting geocoder run");

    let ctx = GeocoderContext::init(config).context("failed to initialize geocoder context")?;
    let result = update_geo_json(&ctx, flags);
    ctx.deinit();

    let summary = result.context("failed to update GeoJSON")?;
    info!(summary = %serde_json::to_string(&summary)?, "run complete");
    Ok(())
}
