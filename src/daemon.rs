use crate::button::ButtonEngine;
use crate::config::bus::ConfigBus;
use crate::config::schema::AppConfig;
use crate::config::watcher;
use crate::error::Result;
use crate::notify::{LogNotifier, Notifier};
use crate::platform::{
    InputSynth, NoWindowInspector, NoWindowProbe, UnavailableSynth, WindowInspector, WindowProbe,
};
use crate::relay::RelayServer;
use crate::session::map::SessionMap;
use crate::session::{NullBackend, SessionBackend};
use crate::state::DeviceState;
use crate::transport::{EventHub, TransportSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The platform collaborators the daemon drives. Desktop builds substitute
/// real implementations; the defaults keep a headless build functional.
pub struct Platform {
    pub notifier: Arc<dyn Notifier>,
    pub sessions: Arc<dyn SessionBackend>,
    pub input: Arc<dyn InputSynth>,
    pub windows: Arc<dyn WindowProbe>,
    pub inspector: Arc<dyn WindowInspector>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            sessions: Arc::new(NullBackend),
            input: Arc::new(UnavailableSynth),
            windows: Arc::new(NoWindowProbe),
            inspector: Arc::new(NoWindowInspector),
        }
    }
}

/// Run the mixd daemon until interrupted or a component signals stop.
///
/// # Errors
/// Returns `MixError` if a subsystem fails during initialization.
pub async fn run(config: AppConfig, config_path: PathBuf, platform: Platform) -> Result<()> {
    let shutdown = CancellationToken::new();
    let bus = Arc::new(ConfigBus::new(config));
    let device_state = Arc::new(DeviceState::new());
    let hub = Arc::new(EventHub::new(bus.clone(), device_state.clone()));

    let session_map = Arc::new(SessionMap::new(
        platform.sessions.clone(),
        bus.clone(),
        device_state.clone(),
        platform.inspector.clone(),
    ));
    session_map.initialize()?;

    let engine = ButtonEngine::new(
        &bus,
        platform.notifier.clone(),
        platform.input.clone(),
        platform.windows.clone(),
    );

    let relay = Arc::new(RelayServer::new(device_state.clone()));
    {
        let connection = &bus.current().connection;
        if connection.relay_enabled() {
            if let Err(e) = relay.start(connection.relay_port).await {
                warn!("relay failed to start: {e}");
            }
        }
    }

    let supervisor = Arc::new(TransportSupervisor::new(
        hub.clone(),
        platform.notifier.clone(),
        shutdown.clone(),
    ));
    supervisor.start(&bus.current()).await;

    let mut handles = Vec::new();
    handles.push(spawn_slider_pump(&hub, &session_map));
    handles.push(spawn_switch_pump(&hub, &session_map));
    handles.push(spawn_relay_pump(&hub, &relay));
    handles.push(tokio::spawn(
        engine.clone().run(hub.subscribe_switches(), shutdown.child_token()),
    ));
    handles.push(spawn_supervisor_reload(&bus, &supervisor));
    handles.push(spawn_session_reload(&bus, &session_map));
    handles.push(spawn_engine_reload(&bus, &engine));
    handles.push(spawn_relay_reload(&bus, &relay));
    handles.push(spawn_config_watcher(&bus, &shutdown, &config_path));

    info!("mixd daemon running");

    tokio::select! {
        () = shutdown.cancelled() => {
            info!("stop signalled, shutting down");
        }
        () = async { tokio::signal::ctrl_c().await.ok(); } => {
            info!("received SIGINT, shutting down");
            shutdown.cancel();
        }
    }

    // Teardown order: stop the event source, then close the fan-outs, then
    // tear down the consumers that own external resources.
    supervisor.shutdown_transport().await;
    hub.close();
    bus.close();
    engine.cancel_all().await;
    relay.stop().await;
    if let Err(e) = session_map.release() {
        warn!("failed to release session map: {e}");
    }

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("daemon stopped");
    Ok(())
}

fn spawn_slider_pump(hub: &Arc<EventHub>, map: &Arc<SessionMap>) -> JoinHandle<()> {
    let mut rx = hub.subscribe_sliders();
    let map = map.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            map.handle_slider_move(event);
        }
    })
}

fn spawn_switch_pump(hub: &Arc<EventHub>, map: &Arc<SessionMap>) -> JoinHandle<()> {
    let mut rx = hub.subscribe_switches();
    let map = map.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            map.handle_switch_change(event);
        }
    })
}

fn spawn_relay_pump(hub: &Arc<EventHub>, relay: &Arc<RelayServer>) -> JoinHandle<()> {
    let mut rx = hub.subscribe_raw();
    let relay = relay.clone();
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            relay.broadcast_state(&raw);
        }
    })
}

fn spawn_supervisor_reload(
    bus: &Arc<ConfigBus>,
    supervisor: &Arc<TransportSupervisor>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    let supervisor = supervisor.clone();
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            supervisor.apply_config(&snapshot).await;
        }
    })
}

fn spawn_session_reload(bus: &Arc<ConfigBus>, map: &Arc<SessionMap>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    let map = map.clone();
    tokio::spawn(async move {
        while let Some(_snapshot) = rx.recv().await {
            info!("config reloaded, re-acquiring audio sessions");
            map.refresh(true);
        }
    })
}

fn spawn_engine_reload(bus: &Arc<ConfigBus>, engine: &Arc<ButtonEngine>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    let engine = engine.clone();
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            engine.apply_reload(&snapshot.button_actions).await;
        }
    })
}

fn spawn_relay_reload(bus: &Arc<ConfigBus>, relay: &Arc<RelayServer>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    let relay = relay.clone();
    tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            relay.apply_config(snapshot.connection.relay_port).await;
        }
    })
}

fn spawn_config_watcher(
    bus: &Arc<ConfigBus>,
    shutdown: &CancellationToken,
    config_path: &std::path::Path,
) -> JoinHandle<()> {
    let bus = bus.clone();
    let cancel = shutdown.child_token();
    let path = config_path.to_path_buf();
    tokio::spawn(async move {
        if let Err(e) = watcher::watch_config(path, bus, cancel).await {
            warn!("config watcher error: {e}");
        }
    })
}
