use anyhow::{bail, Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod sim;

use call_session_cell::{
    CallSessionManager, EventKind, FailureReason, LoopbackSignaling, MediaKind, SessionHandle,
    SessionStatus, Subscription,
};
use shared_config::CallSessionConfig;
use shared_models::{LocalParticipant, ParticipantRole};

use sim::{SimulatedEngine, SimulatedMedia};

const SESSION_ID: &str = "consult-demo-001";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scenario {
    Happy,
    NetworkDrop,
    Denied,
}

impl Scenario {
    fn from_args() -> Result<Self> {
        match std::env::args().nth(1).as_deref() {
            None | Some("happy") => Ok(Scenario::Happy),
            Some("drop") => Ok(Scenario::NetworkDrop),
            Some("denied") => Ok(Scenario::Denied),
            Some(other) => bail!("unknown scenario '{}', expected happy|drop|denied", other),
        }
    }
}

struct Party {
    name: &'static str,
    manager: CallSessionManager,
    media: Arc<SimulatedMedia>,
    engine: Arc<SimulatedEngine>,
    _events: Subscription,
}

impl Party {
    fn new(name: &'static str, config: &CallSessionConfig, signaling: Arc<LoopbackSignaling>, deny_media: bool) -> Self {
        let media = SimulatedMedia::new(name, deny_media);
        let engine = SimulatedEngine::new(name, &config.ice_servers);
        let manager = CallSessionManager::new(config.clone(), media.clone(), engine.clone(), signaling);

        let events = manager.events().subscribe_all(move |event| {
            let json = serde_json::to_string(event).unwrap_or_else(|e| format!("<unserializable: {}>", e));
            match event.kind() {
                EventKind::Error => warn!("[{}] {}", name, json),
                _ => info!("[{}] {}", name, json),
            }
        });

        Self {
            name,
            manager,
            media,
            engine,
            _events: events,
        }
    }

    fn start(&self, participant_id: &str, display_name: &str, role: ParticipantRole) -> Result<SessionHandle> {
        let local = LocalParticipant::new(participant_id, display_name, role);
        self.manager
            .start(SESSION_ID, local)
            .with_context(|| format!("{} could not start the session", self.name))
    }
}

async fn wait_connected(handle: &mut SessionHandle, limit: Duration) -> Result<()> {
    let status = timeout(limit, handle.wait_for(|s| *s == SessionStatus::Connected || s.is_terminal()))
        .await
        .context("timed out waiting for the call to connect")?;

    if status != SessionStatus::Connected {
        bail!("session {} stopped in {}", handle.session_id(), status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,call_session_cell=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let scenario = Scenario::from_args()?;
    let config = CallSessionConfig::from_env();
    info!("Starting consultation simulator ({:?})", scenario);
    info!(
        "Negotiation timeout {:?}, reconnect schedule {:?}, ICE servers {:?}",
        config.negotiation_timeout,
        config.reconnect.schedule(),
        config.ice_servers
    );

    let (provider_link, patient_link) = LoopbackSignaling::pair();
    let provider = Party::new("provider", &config, provider_link, false);
    let patient = Party::new("patient", &config, patient_link, scenario == Scenario::Denied);

    let mut patient_handle = patient.start("patient-7f3a", "Ama Owusu", ParticipantRole::Patient)?;
    let mut provider_handle = provider.start("doctor-19c2", "Dr. Kwame Mensah", ParticipantRole::Provider)?;

    if scenario == Scenario::Denied {
        let status = patient_handle.wait_terminal().await;
        info!("Patient session finished as {}", status);
        provider.manager.end().await;
        patient.manager.end().await;
        return Ok(());
    }

    let limit = config.negotiation_timeout + Duration::from_secs(1);
    let (provider_ready, patient_ready) = futures::future::join(
        wait_connected(&mut provider_handle, limit),
        wait_connected(&mut patient_handle, limit),
    )
    .await;
    provider_ready?;
    patient_ready?;
    info!("Both parties connected");

    patient.manager.send_chat("Hello doctor, can you hear me?").await?;
    provider.manager.send_chat("Loud and clear. How are you feeling today?").await?;

    patient.manager.toggle_media(MediaKind::Audio).await?;
    patient.manager.toggle_media(MediaKind::Audio).await?;

    provider.manager.toggle_media(MediaKind::Screen).await?;
    sleep(Duration::from_millis(300)).await;
    provider.media.stop_sharing_from_browser();
    sleep(Duration::from_millis(300)).await;
    info!("Provider screen sharing: {}", provider.manager.is_screen_sharing());

    if scenario == Scenario::NetworkDrop {
        provider.engine.sever_link();
        sleep(Duration::from_millis(1500)).await;
        provider.engine.restore_link();

        let recovered = timeout(
            Duration::from_secs(30),
            provider_handle.wait_for(|s| *s == SessionStatus::Connected || s.is_terminal()),
        )
        .await
        .context("provider never recovered")?;
        info!("Provider after network drop: {}", recovered);
        if recovered == (SessionStatus::Failed { reason: FailureReason::ConnectionLost }) {
            provider.manager.retry_connection()?;
            wait_connected(&mut provider_handle, limit).await?;
        }
    }

    sleep(Duration::from_millis(200)).await;
    info!(
        "Chat log: {}",
        serde_json::to_string_pretty(&provider.manager.chat_history()).context("chat log")?
    );

    provider.manager.end().await;
    let patient_final = timeout(Duration::from_secs(5), patient_handle.wait_terminal())
        .await
        .context("patient never observed the hang-up")?;
    patient.manager.end().await;

    info!(
        "Call over. Provider {}, patient {}; live tracks left: provider={}, patient={}",
        provider.manager.status(),
        patient_final,
        provider.media.live_tracks(),
        patient.media.live_tracks()
    );
    Ok(())
}
