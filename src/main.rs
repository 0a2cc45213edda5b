use meshmon::cli::Cli;
use meshmon::config::defaults::{AGENT_CACHE_FILE, LOG_FILE};
use meshmon::config::{AgentConfig, MonitorMode};
use meshmon::core::emit;
use meshmon::core::health::monitor::HealthPaths;
use meshmon::core::health::HealthMonitor;
use meshmon::core::logger::Logger;
use meshmon::core::mesh::discovery::SysinfoEndpoint;
use meshmon::core::mesh::reporter::RemoteReporter;
use meshmon::core::mesh::routing::RoutingPaths;
use meshmon::core::mesh::{AgentDiscovery, MonitorScheduler, ProbeEngine, RoutingAdapter};
use meshmon::core::voip::probe::OwnedSocketTransport;
use meshmon::core::voip::{EmptyRegistrar, PhoneQualityMonitor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_shutdown_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_terminate as usize);
        libc::signal(libc::SIGTERM, on_terminate as usize);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let (mut config, warnings) = AgentConfig::load(&cli.config);
    if let Some(domain) = cli.mesh_domain {
        config.monitor.mesh_domain = domain;
    }

    let log = Arc::new(Logger::new(PathBuf::from(LOG_FILE), config.monitor.log_level));
    for warning in &warnings {
        log.warn("CONFIG", warning);
    }

    if !config.monitor.enabled || config.monitor.mode == MonitorMode::Disabled {
        log.info("MAIN", "mesh monitoring disabled by configuration");
        eprintln!("meshmon: monitoring disabled by configuration");
        return ExitCode::SUCCESS;
    }

    // Services come up leaves-first; teardown mirrors this in reverse.
    let health = HealthMonitor::new(HealthPaths::default(), Arc::clone(&log));

    let routing = match RoutingAdapter::new(
        config.monitor.routing_daemon,
        RoutingPaths::default(),
        Duration::from_secs(config.monitor.routing_cache_s),
        Arc::clone(&log),
    ) {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            log.error("MAIN", &format!("failed to initialize routing adapter: {}", e));
            eprintln!("meshmon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let engine = match ProbeEngine::new(&config.monitor, Arc::clone(&log)) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            log.error("MAIN", &format!("failed to initialize probe engine: {}", e));
            eprintln!("meshmon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let discovery = Arc::new(AgentDiscovery::new(
        PathBuf::from(AGENT_CACHE_FILE),
        SysinfoEndpoint::default(),
        config.monitor.mesh_domain.clone(),
        emit::node_name(),
        Arc::clone(&log),
    ));

    if cli.scan_once {
        let found = discovery.scan();
        println!("discovery scan complete: {} agents confirmed", found);
        return ExitCode::SUCCESS;
    }

    install_shutdown_handler();

    let scheduler = Arc::new(MonitorScheduler::new(
        config.monitor.clone(),
        Arc::clone(&engine),
        Arc::clone(&routing),
        Arc::clone(&discovery),
        Arc::clone(&health),
        Arc::clone(&log),
    ));

    let mut handles = Vec::new();

    let responder_engine = Arc::clone(&engine);
    handles.push(std::thread::spawn(move || responder_engine.run_responder()));

    let scheduler_ref = Arc::clone(&scheduler);
    handles.push(std::thread::spawn(move || scheduler_ref.run()));

    let health_ref = Arc::clone(&health);
    handles.push(std::thread::spawn(move || health_ref.run_periodic()));

    // Standalone operation: own SIP socket, no registrar. Servers embedding
    // the library wire their user table through RegistrarView instead.
    // Full monitoring mode upgrades the phone probe to the media flavour.
    let mut voip_config = config.voip.clone();
    if config.monitor.mode == MonitorMode::Full {
        voip_config.media_probe = true;
    }

    let voip = match OwnedSocketTransport::new() {
        Ok(transport) if config.voip.enabled => {
            let monitor = Arc::new(PhoneQualityMonitor::new(
                Arc::new(EmptyRegistrar),
                Arc::new(transport),
                voip_config,
                config.monitor.mesh_domain.clone(),
                Arc::clone(&health),
                Arc::clone(&log),
            ));
            let monitor_ref = Arc::clone(&monitor);
            handles.push(std::thread::spawn(move || monitor_ref.run()));
            Some(monitor)
        }
        Ok(_) => None,
        Err(e) => {
            log.warn("MAIN", &format!("quality monitor disabled, no SIP socket: {}", e));
            None
        }
    };

    let reporter = if config.monitor.collector_url.is_empty() {
        None
    } else {
        let reporter = Arc::new(RemoteReporter::new(
            config.monitor.collector_url.clone(),
            config.monitor.network_status_report_s,
            Arc::clone(&health),
            Arc::clone(&log),
        ));
        let reporter_ref = Arc::clone(&reporter);
        handles.push(std::thread::spawn(move || reporter_ref.run()));
        Some(reporter)
    };

    log.info("MAIN", "meshmon agent started");

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    log.info("MAIN", "shutting down");

    // Reverse dependency order: reporter and voip first, then the scheduler,
    // then the engine that their threads read from.
    if let Some(reporter) = &reporter {
        reporter.shutdown();
    }
    if let Some(voip) = &voip {
        voip.shutdown();
    }
    scheduler.shutdown();
    engine.shutdown();
    health.shutdown();

    for handle in handles {
        let _ = handle.join();
    }

    discovery.save_cache();
    health.export_health_json();
    log.info("MAIN", "shutdown complete");
    ExitCode::SUCCESS
}
