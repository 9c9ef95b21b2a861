use std::sync::Arc;

use pingora::services::listening::Service;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;

use pingbff::config::{Config, Listener};
use pingbff::core::status;
use pingbff::logging::Logger;
use pingbff::proxy::{AggregationEngine, BffRouter, FaultPolicyController, UpstreamPool};
use pingbff::service::{http::BffHttpApp, status::StatusHttpApp};

fn main() {
    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = match Config::load_yaml_with_opt_override(&opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = match &config.pingbff.log {
        Some(log_cfg) => {
            let logger = Logger::new(log_cfg.clone());
            logger.init_env_logger();
            Some(logger)
        }
        None => {
            env_logger::init();
            None
        }
    };

    log::info!("Loading upstream services...");
    let (pool, discoveries) = match UpstreamPool::from_config(&config) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("Failed to load upstream services: {e}");
            std::process::exit(1);
        }
    };

    log::info!("Compiling plans...");
    let engine = AggregationEngine::new(
        Arc::new(pool),
        Arc::new(FaultPolicyController::from_config(&config)),
    );
    let router = match BffRouter::from_config(&config, engine) {
        Ok(router) => Arc::new(router),
        Err(e) => {
            log::error!("Failed to compile plans: {e}");
            std::process::exit(1);
        }
    };
    let plan_count = router.plan_count();

    let mut bff_service = BffHttpApp::bff_http_service(&config, router);

    log::info!("Adding listeners...");
    if let Err(e) = add_listeners(&mut bff_service, &config.listeners) {
        log::error!("Failed to add listeners: {e}");
        std::process::exit(1);
    }

    let mut pingbff_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        pingbff_server.add_service(log_service);
    }

    log::info!("Adding {} discovery services...", discoveries.len());
    for discovery in discoveries {
        pingbff_server.add_service(discovery);
    }

    if let Some(status_cfg) = &config.pingbff.status {
        log::info!("Adding status HTTP...");
        pingbff_server.add_service(StatusHttpApp::status_http_service(status_cfg));
    }

    log::info!("Bootstrapping...");
    pingbff_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    pingbff_server.add_service(bff_service);
    status::mark_ready(plan_count);

    log::info!("Starting Server...");
    pingbff_server.run_forever();
}

/// Adds TCP and TLS listeners to the client facing service.
fn add_listeners(
    service: &mut Service<BffHttpApp>,
    listeners: &[Listener],
) -> Result<(), Box<dyn std::error::Error>> {
    for list_cfg in listeners {
        let address = list_cfg.address.to_string();
        match &list_cfg.tls {
            Some(tls) => {
                let mut settings = TlsSettings::intermediate(&tls.cert_path, &tls.key_path)?;
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                service.add_tls_with_settings(&address, None, settings);
            }
            None => service.add_tcp(&address),
        }
    }
    Ok(())
}
