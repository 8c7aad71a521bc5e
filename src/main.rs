use magic_gateway::{App, Config, app, secrets, telemetry};
use tracing::info;

fn main() -> anyhow::Result<()> {
	// The subscriber must exist before config parsing so its warnings land.
	let debug = std::env::var("MAGIC_GATEWAY_DEBUG").as_deref() == Ok("true");
	telemetry::init(debug);

	let cfg = Config::from_env()?;
	let catalog = secrets::SecretCatalog::from_env(
		cfg.env_blacklist.clone(),
		cfg.env_whitelist_prefixes.clone(),
	);
	info!(entries = catalog.len(), "environment snapshot taken");

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			let app = App::new(cfg, catalog)?;
			app::run(app).await
		})
}
