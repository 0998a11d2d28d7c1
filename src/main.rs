use std::{env, process, sync::Arc};

use hubpipe::{
    config::Config,
    core::mqtt::MqttSessionFactory,
    logger::LoggerManager,
    print_error, ConnectionArgs, Credential, Event, PipelineBuilder,
};
use tracing::{debug, error, info, warn};

const API_VERSION: &str = "2018-06-30";

/// Device identity, read from the environment so secrets stay out of the
/// config file.
struct Device {
    hostname: String,
    device_id: String,
    sas_token: Option<String>,
}

impl Device {
    fn from_env() -> Result<Self, String> {
        let var = |name: &str| env::var(name).map_err(|_| format!("{name} is not set"));
        Ok(Self {
            hostname: var("HUBPIPE_HOSTNAME")?,
            device_id: var("HUBPIPE_DEVICE_ID")?,
            sas_token: env::var("HUBPIPE_SAS_TOKEN").ok(),
        })
    }

    fn connection_args(&self) -> ConnectionArgs {
        ConnectionArgs::new(
            self.hostname.clone(),
            format!("{}/{}/?api-version={}", self.hostname, self.device_id, API_VERSION),
            self.device_id.clone(),
        )
    }
}

#[tokio::main]
async fn main() {
    let cfg = Config::new().unwrap_or_else(|e| {
        print_error!("{}", e);
        process::exit(1);
    });
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting hubpipe version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.transport);

    let device = Device::from_env().unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });

    let factory = MqttSessionFactory::new(cfg.transport.clone()).unwrap_or_else(|e| {
        error!("Failed to create MQTT session factory: {}", e);
        process::exit(1);
    });
    let pipeline = PipelineBuilder::new(cfg.pipeline.clone())
        .session_factory(Arc::new(factory))
        .on_event(|event| match event {
            Event::IncomingMessage { topic, payload } => {
                info!("Message on {}: {}", topic, String::from_utf8_lossy(&payload))
            }
        })
        .build()
        .unwrap_or_else(|e| {
            error!("Failed to build pipeline: {}", e);
            process::exit(1);
        });

    let startup = async {
        pipeline.set_connection_args(device.connection_args()).await?;
        if let Some(token) = &device.sas_token {
            pipeline
                .set_credential(Credential::SasToken(token.clone()))
                .await?;
        }
        pipeline.connect().await?;
        pipeline
            .subscribe(format!("devices/{}/messages/devicebound/#", device.device_id))
            .await
    };
    if let Err(e) = startup.await {
        error!("Failed to connect {}: {}", device.device_id, e.chain_report());
        pipeline.shutdown();
        process::exit(1);
    }
    info!("Connected as {}, waiting for messages", device.device_id);

    let mut state = pipeline.connection_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, disconnecting...");
            if let Err(e) = pipeline.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        }
        _ = state.wait_for(|s| !s.is_connected()) => {
            error!("Connection lost");
        }
    }

    pipeline.shutdown();
    info!("Shutdown complete");
}
