use boss_cube_remote::domain::settings::SettingsService;
use boss_cube_remote::infrastructure::logging;
use boss_cube_remote::presentation::app::RemoteApp;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Boss Cube Remote");
    info!("Settings: {:?}", settings_service.path());
    if let Err(e) = settings_service.save_if_missing() {
        warn!("Could not write default settings: {}", e);
    }

    let app = RemoteApp::connect(settings_service.get()).await?;
    app.run().await
}
