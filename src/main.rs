//! IronLog 演示服务入口

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use ironlog::{api, app_state::AppState, config::Config, infrastructure::logging};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量
    dotenvy::dotenv().ok();

    // 2. 加载配置（CONFIG_PATH 指向的文件优先）
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);

    // 3. 编译脱敏规则（失败即终止启动），日志输出经过同一个脱敏器
    let masker = AppState::build_masker(&config)?;
    let _log_guard = match logging::init_logging(&config.logging, masker.clone()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging setup failed ({:#}), falling back to defaults", e);
            logging::init_default_logging()
        }
    };

    // 4. 初始化应用状态
    let state = AppState::new(config.clone(), masker)?;

    tracing::info!(service = %config.service.name, "Starting IronLog service");
    if let Some(url) = &config.service.notify_url {
        tracing::info!(notify_url = %url, "Downstream notifications enabled");
    }

    let app = api::routes(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&config.service.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.service.bind_addr))?;

    tracing::info!("Server listening on http://{}", config.service.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
