//! Per-account engine ownership and callback dispatch.
//!
//! The [`Manager`] lazily loads one [`EngineState`] per account from the
//! account's storage directory and keeps it behind a mutex. Every engine
//! call made on behalf of a [`Session`] goes through [`Manager::with_engine`],
//! which hands the engine a [`ManagerOps`] dispatcher. Callbacks resolve
//! their target session through the account-keyed registry and queue an
//! [`EngineSignal`] for it.
//!
//! Lock order is engine first, then registry. Callbacks never touch an
//! engine lock.

use crate::account::{AccountIdentity, SessionContext};
use crate::crypto::{FingerprintValue, PrivateKey};
use crate::engine::storage::{self, AccountPaths};
use crate::engine::{
    ContextView, EngineOps, EngineSettings, EngineState, Fingerprint, FingerprintStore,
    InstanceTag, MessageEvent, Policy, SmpEvent,
};
use crate::session::keygen::KeyGenerationWorker;
use crate::session::Session;
use crate::transport::Message;
use crate::utils::{CryptoError, OverlayConfig, OverlayError, Result, SessionError};
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Capacity of the manager event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Account-level notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// Key generation for an account was scheduled
    KeyGenerationStarted {
        /// Account the key is for
        account_id: String,
    },
    /// Key generation for an account completed
    KeyGenerationFinished {
        /// Account the key is for
        account_id: String,
        /// True when generation failed
        error: bool,
    },
    /// A peer key was seen for the first time
    NewFingerprint {
        /// Local account
        account_id: String,
        /// Peer owning the key
        peer: String,
        /// Fingerprint of the key
        fingerprint: FingerprintValue,
    },
}

/// Engine callback queued for a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineSignal {
    Inject(String),
    GoneSecure,
    GoneInsecure,
    StillSecure,
    NewFingerprint(FingerprintValue),
    Smp {
        event: SmpEvent,
        progress: u8,
        question: Option<String>,
    },
    Notice {
        event: MessageEvent,
        message: Option<String>,
        error: Option<String>,
    },
    TrustChanged,
    KeyGenerationStarted,
    KeyGenerationFinished {
        error: bool,
    },
}

/// A message held back until the session can process it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    /// Composed locally, not yet sent
    Outgoing(Message),
    /// Received, not yet decrypted
    Incoming(Message),
}

/// Loaded state of one account
#[derive(Debug)]
pub struct AccountState {
    identity: AccountIdentity,
    paths: AccountPaths,
    engine: Mutex<EngineState>,
    timer: watch::Sender<u64>,
}

impl AccountState {
    /// The account
    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    /// The account's storage locations
    pub fn paths(&self) -> &AccountPaths {
        &self.paths
    }

    /// Whether the account has a private key
    pub fn has_private_key(&self) -> bool {
        lock(&self.engine).private_key().is_some()
    }

    /// Our instance tag
    pub fn instance_tag(&self) -> InstanceTag {
        lock(&self.engine).instance_tag()
    }

    /// Current poll interval in seconds
    pub fn poll_interval(&self) -> u64 {
        *self.timer.borrow()
    }
}

#[derive(Debug)]
struct ManagerInner {
    data_dir: PathBuf,
    settings: EngineSettings,
    policy: RwLock<Policy>,
    accounts: Mutex<HashMap<String, Arc<AccountState>>>,
    keygens: Mutex<HashSet<String>>,
    failed_keygens: Mutex<HashSet<String>>,
    deferred: Mutex<HashMap<SessionContext, VecDeque<Deferred>>>,
    registry: Mutex<HashMap<SessionContext, mpsc::UnboundedSender<EngineSignal>>>,
    events: broadcast::Sender<ManagerEvent>,
}

/// Owner of all per-account engine state and factory of sessions
#[derive(Debug, Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager from configuration
    pub fn new(config: &OverlayConfig) -> Self {
        Self::with_settings(
            config.storage.data_dir.clone(),
            config.otr.policy,
            EngineSettings::from(&config.otr),
        )
    }

    /// Create a manager storing accounts below `data_dir`
    pub fn with_settings(data_dir: impl Into<PathBuf>, policy: Policy, settings: EngineSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                data_dir: data_dir.into(),
                settings,
                policy: RwLock::new(policy),
                accounts: Mutex::new(HashMap::new()),
                keygens: Mutex::new(HashSet::new()),
                failed_keygens: Mutex::new(HashSet::new()),
                deferred: Mutex::new(HashMap::new()),
                registry: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Base storage directory
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// The global policy
    pub fn policy(&self) -> Policy {
        *self
            .inner
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the global policy; applies to every later protocol decision
    pub fn set_policy(&self, policy: Policy) {
        log::info!("Policy set to {}", policy);
        *self
            .inner
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Subscribe to account-level events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// The engine state of an account, loaded from storage on first use
    ///
    /// # Errors
    ///
    /// Fails when a storage file exists but cannot be read or parsed
    pub fn engine_state(&self, account: &AccountIdentity) -> Result<Arc<AccountState>> {
        let mut accounts = lock(&self.inner.accounts);
        if let Some(state) = accounts.get(&account.account_id) {
            return Ok(Arc::clone(state));
        }

        let paths = AccountPaths::new(&self.inner.data_dir, &account.account_id);
        let private_key = storage::read_private_key(&paths)?;
        let fingerprints = storage::read_fingerprints(&paths, account)?;
        let instance_tag = match storage::read_instance_tag(&paths, account)? {
            Some(tag) => tag,
            None => {
                let tag = InstanceTag::generate();
                storage::write_instance_tag(&paths, account, tag)?;
                log::info!("Assigned instance tag {} to {}", tag, account);
                tag
            }
        };

        log::info!(
            "Loaded {}: {} known fingerprints, private key {}",
            account,
            fingerprints.len(),
            if private_key.is_some() { "present" } else { "missing" }
        );

        let (timer, timer_rx) = watch::channel(0);
        let state = Arc::new(AccountState {
            identity: account.clone(),
            paths,
            engine: Mutex::new(EngineState::new(
                account.clone(),
                self.inner.settings,
                private_key,
                fingerprints,
                instance_tag,
            )),
            timer,
        });
        accounts.insert(account.account_id.clone(), Arc::clone(&state));

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(poll_timer(
                Arc::downgrade(&self.inner),
                account.account_id.clone(),
                timer_rx,
            ));
        }

        Ok(state)
    }

    /// Run `f` against the account's engine with this manager as callback
    /// target
    pub(crate) fn with_engine<R>(
        &self,
        account: &AccountIdentity,
        f: impl FnOnce(&mut EngineState, &dyn EngineOps) -> R,
    ) -> Result<R> {
        let state = self.engine_state(account)?;
        let ops = ManagerOps {
            inner: &self.inner,
            account: &state,
            key_requested: Cell::new(false),
        };

        let result = {
            let mut engine = lock(&state.engine);
            f(&mut *engine, &ops as &dyn EngineOps)
        };

        if ops.key_requested.get() && !self.is_generating_key(&account.account_id) {
            self.schedule_key_generation(account);
        }
        Ok(result)
    }

    /// Schedule private key generation. Returns false when one is already
    /// in flight for the account or it could not be scheduled.
    ///
    /// An earlier failure stops the engine from asking for a key again on
    /// its own; calling this clears that state.
    pub fn create_new_private_key(&self, account: &AccountIdentity) -> bool {
        if lock(&self.inner.failed_keygens).remove(&account.account_id) {
            log::info!("Retrying key generation for {}", account);
        }
        self.schedule_key_generation(account)
    }

    fn schedule_key_generation(&self, account: &AccountIdentity) -> bool {
        let state = match self.engine_state(account) {
            Ok(state) => state,
            Err(err) => {
                log::error!("Cannot generate a key for {}: {}", account, err);
                return false;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!("Key generation for {} needs an async runtime", account);
            return false;
        };

        if !lock(&self.inner.keygens).insert(account.account_id.clone()) {
            log::debug!("Key generation for {} already in flight", account);
            return false;
        }

        let worker = KeyGenerationWorker::prepare(account, state.paths.clone());
        log::info!("Generating private key for {}", account);
        self.signal_account(&account.account_id, &EngineSignal::KeyGenerationStarted);
        self.publish(ManagerEvent::KeyGenerationStarted {
            account_id: account.account_id.clone(),
        });

        let manager = self.clone();
        runtime.spawn(async move {
            let outcome = match tokio::task::spawn_blocking(move || worker.calculate()).await {
                Ok(worker) => worker.finalize(),
                Err(err) => Err(CryptoError::KeyGeneration {
                    reason: err.to_string(),
                }
                .into()),
            };
            manager.key_generation_finished(&state, outcome);
        });

        true
    }

    fn key_generation_finished(&self, state: &AccountState, outcome: Result<PrivateKey>) {
        let account_id = state.identity.account_id.clone();
        let error = match outcome {
            Ok(key) => {
                lock(&state.engine).install_private_key(key);
                lock(&self.inner.failed_keygens).remove(&account_id);
                false
            }
            Err(err) => {
                log::error!("Key generation for {} failed: {}", state.identity, err);
                lock(&self.inner.failed_keygens).insert(account_id.clone());
                true
            }
        };

        lock(&self.inner.keygens).remove(&account_id);
        self.signal_account(&account_id, &EngineSignal::KeyGenerationFinished { error });
        self.publish(ManagerEvent::KeyGenerationFinished { account_id, error });
    }

    /// Whether key generation is in flight for an account
    pub fn is_generating_key(&self, account_id: &str) -> bool {
        lock(&self.inner.keygens).contains(account_id)
    }

    /// Whether the last key generation for an account failed and no explicit
    /// retry was made since
    pub fn key_generation_failed(&self, account_id: &str) -> bool {
        lock(&self.inner.failed_keygens).contains(account_id)
    }

    /// Fingerprint of the account's own key
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded
    pub fn fingerprint_for_account(&self, account: &AccountIdentity) -> Result<Option<FingerprintValue>> {
        let state = self.engine_state(account)?;
        let engine = lock(&state.engine);
        Ok(engine.private_key().map(PrivateKey::fingerprint))
    }

    /// Our instance tag for an account
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded
    pub fn instance_tag(&self, account: &AccountIdentity) -> Result<InstanceTag> {
        Ok(self.engine_state(account)?.instance_tag())
    }

    /// Persist the account's fingerprint table
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be written
    pub fn save_fingerprints(&self, account: &AccountIdentity) -> Result<()> {
        let state = self.engine_state(account)?;
        let engine = lock(&state.engine);
        storage::write_fingerprints(&state.paths, engine.fingerprints())
    }

    /// Every fingerprint known to the account, with `in_use` set for those
    /// referenced by a live session
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded
    pub fn known_fingerprints(&self, account: &AccountIdentity) -> Result<Vec<Fingerprint>> {
        let state = self.engine_state(account)?;
        let engine = lock(&state.engine);
        let registry = lock(&self.inner.registry);

        Ok(engine
            .fingerprints()
            .all()
            .into_iter()
            .map(|mut fingerprint| {
                let ctx = SessionContext::new(account, fingerprint.owner_peer.clone());
                fingerprint.in_use =
                    registry.contains_key(&ctx) && engine.fingerprint_in_use(&ctx, &fingerprint.value);
                fingerprint
            })
            .collect())
    }

    /// Change the trust flag of a fingerprint and persist the table.
    /// Returns false if the fingerprint is unknown.
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded or the table cannot be written
    pub fn trust_fingerprint(
        &self,
        account: &AccountIdentity,
        peer: &str,
        value: &FingerprintValue,
        trust: bool,
    ) -> Result<bool> {
        let state = self.engine_state(account)?;
        {
            let mut engine = lock(&state.engine);
            if !engine.set_trust(peer, value, trust) {
                return Ok(false);
            }
            storage::write_fingerprints(&state.paths, engine.fingerprints())?;
        }

        log::info!(
            "Fingerprint {} of {} marked {}",
            value,
            peer,
            if trust { "trusted" } else { "untrusted" }
        );
        self.signal(&SessionContext::new(account, peer), EngineSignal::TrustChanged);
        Ok(true)
    }

    /// Delete a fingerprint. Returns false, changing nothing, when it is
    /// unknown or in use by a live session.
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded or the table cannot be written
    pub fn forget_fingerprint(
        &self,
        account: &AccountIdentity,
        peer: &str,
        value: &FingerprintValue,
    ) -> Result<bool> {
        let state = self.engine_state(account)?;
        let mut engine = lock(&state.engine);

        let ctx = SessionContext::new(account, peer);
        let live = lock(&self.inner.registry).contains_key(&ctx);
        if live && engine.fingerprint_in_use(&ctx, value) {
            log::warn!("Refusing to forget fingerprint {} of {}: in use", value, peer);
            return Ok(false);
        }

        if !engine.forget_fingerprint(peer, value) {
            return Ok(false);
        }
        storage::write_fingerprints(&state.paths, engine.fingerprints())?;
        log::info!("Forgot fingerprint {} of {}", value, peer);
        Ok(true)
    }

    /// Create the session for a conversation of `account` with `peer`.
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded or a session for the
    /// conversation is already live
    pub fn create_session(&self, account: &AccountIdentity, peer: &str) -> Result<Session> {
        self.engine_state(account)?;
        let ctx = SessionContext::new(account, peer);
        let (signals, receiver) = mpsc::unbounded_channel();

        {
            let mut registry = lock(&self.inner.registry);
            if registry.contains_key(&ctx) {
                return Err(SessionError::InvalidState {
                    state: format!("a session for {ctx} is already live"),
                }
                .into());
            }
            registry.insert(ctx.clone(), signals);
        }

        log::debug!("Created session {}", ctx);
        Ok(Session::new(self.clone(), account.clone(), ctx, receiver))
    }

    /// Snapshot of a conversation's engine context
    pub(crate) fn context_view(&self, account: &AccountIdentity, ctx: &SessionContext) -> Result<ContextView> {
        let state = self.engine_state(account)?;
        let engine = lock(&state.engine);
        Ok(engine.context_view(ctx))
    }

    /// Tear down the registry entry and engine context of a session
    pub(crate) fn close_session(&self, ctx: &SessionContext) {
        let state = lock(&self.inner.accounts).get(&ctx.account_id).cloned();
        if let Some(state) = state {
            lock(&state.engine).forget_context(ctx);
        }

        lock(&self.inner.registry).remove(ctx);
        if let Some(dropped) = lock(&self.inner.deferred).remove(ctx) {
            if !dropped.is_empty() {
                log::warn!("Dropping {} deferred messages of {}", dropped.len(), ctx);
            }
        }
        log::debug!("Closed session {}", ctx);
    }

    /// Queue a message for a conversation
    pub fn defer(&self, ctx: &SessionContext, message: Deferred) {
        log::debug!("Deferring message for {}", ctx);
        lock(&self.inner.deferred)
            .entry(ctx.clone())
            .or_default()
            .push_back(message);
    }

    /// Whether a conversation has queued messages
    pub fn has_deferred(&self, ctx: &SessionContext) -> bool {
        lock(&self.inner.deferred)
            .get(ctx)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Take every queued message of a conversation in arrival order
    pub fn take_deferred(&self, ctx: &SessionContext) -> VecDeque<Deferred> {
        lock(&self.inner.deferred).remove(ctx).unwrap_or_default()
    }

    /// Persist all fingerprint tables and release loaded accounts.
    /// Live sessions should be closed first.
    pub fn shutdown(&self) {
        let accounts: Vec<_> = lock(&self.inner.accounts).drain().map(|(_, state)| state).collect();
        for state in accounts {
            state.timer.send_replace(0);
            let engine = lock(&state.engine);
            if let Err(err) = storage::write_fingerprints(&state.paths, engine.fingerprints()) {
                log::error!("Failed to save fingerprints of {}: {}", state.identity, err);
            }
        }
        log::info!("Manager shut down");
    }

    fn poll(&self, account_id: &str) {
        let state = lock(&self.inner.accounts).get(account_id).cloned();
        let Some(state) = state else {
            return;
        };

        let ops = ManagerOps {
            inner: &self.inner,
            account: &state,
            key_requested: Cell::new(false),
        };
        lock(&state.engine).message_poll(&ops);
    }

    fn signal(&self, ctx: &SessionContext, signal: EngineSignal) {
        dispatch(&self.inner, ctx, signal);
    }

    fn signal_account(&self, account_id: &str, signal: &EngineSignal) {
        let registry = lock(&self.inner.registry);
        for (ctx, session) in registry.iter().filter(|(ctx, _)| ctx.account_id == account_id) {
            if session.send(signal.clone()).is_err() {
                log::debug!("Session {} is gone", ctx);
            }
        }
    }

    fn publish(&self, event: ManagerEvent) {
        if self.inner.events.send(event).is_err() {
            log::trace!("No manager event subscribers");
        }
    }
}

/// Engine callback target for one account
struct ManagerOps<'a> {
    inner: &'a ManagerInner,
    account: &'a AccountState,
    key_requested: Cell<bool>,
}

impl EngineOps for ManagerOps<'_> {
    fn policy(&self, _ctx: &SessionContext) -> Policy {
        *self
            .inner
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn create_private_key(&self, account: &AccountIdentity) -> bool {
        if lock(&self.inner.failed_keygens).contains(&account.account_id) {
            log::debug!("Key generation for {} failed before; not retrying", account);
            return false;
        }
        log::debug!("Engine requested a private key for {}", account);
        self.key_requested.set(true);
        true
    }

    fn is_logged_in(&self, ctx: &SessionContext) -> Option<bool> {
        lock(&self.inner.registry).contains_key(ctx).then_some(true)
    }

    fn inject_message(&self, ctx: &SessionContext, message: String) {
        dispatch(self.inner, ctx, EngineSignal::Inject(message));
    }

    fn new_fingerprint(&self, ctx: &SessionContext, fingerprint: &FingerprintValue) {
        dispatch(self.inner, ctx, EngineSignal::NewFingerprint(*fingerprint));
        if self
            .inner
            .events
            .send(ManagerEvent::NewFingerprint {
                account_id: ctx.account_id.clone(),
                peer: ctx.peer_name.clone(),
                fingerprint: *fingerprint,
            })
            .is_err()
        {
            log::trace!("No manager event subscribers");
        }
    }

    fn write_fingerprints(&self, account: &AccountIdentity, store: &FingerprintStore) {
        if let Err(err) = storage::write_fingerprints(&self.account.paths, store) {
            log::error!("Failed to save fingerprints of {}: {}", account, err);
        }
    }

    fn gone_secure(&self, ctx: &SessionContext, _view: &ContextView) {
        dispatch(self.inner, ctx, EngineSignal::GoneSecure);
    }

    fn gone_insecure(&self, ctx: &SessionContext, _view: &ContextView) {
        dispatch(self.inner, ctx, EngineSignal::GoneInsecure);
    }

    fn still_secure(&self, ctx: &SessionContext, _view: &ContextView, _is_reply: bool) {
        dispatch(self.inner, ctx, EngineSignal::StillSecure);
    }

    fn handle_smp_event(
        &self,
        ctx: &SessionContext,
        event: SmpEvent,
        progress: u8,
        question: Option<&str>,
    ) {
        dispatch(
            self.inner,
            ctx,
            EngineSignal::Smp {
                event,
                progress,
                question: question.map(str::to_string),
            },
        );
    }

    fn handle_msg_event(
        &self,
        ctx: &SessionContext,
        event: MessageEvent,
        message: Option<&str>,
        error: Option<&OverlayError>,
    ) {
        dispatch(
            self.inner,
            ctx,
            EngineSignal::Notice {
                event,
                message: message.map(str::to_string),
                error: error.map(ToString::to_string),
            },
        );
    }

    fn timer_control(&self, interval: u64) {
        log::debug!("Poll interval of {} set to {}s", self.account.identity, interval);
        self.account.timer.send_replace(interval);
    }
}

fn dispatch(inner: &ManagerInner, ctx: &SessionContext, signal: EngineSignal) {
    match lock(&inner.registry).get(ctx) {
        Some(session) => {
            if session.send(signal).is_err() {
                log::debug!("Session {} is gone", ctx);
            }
        }
        None => log::debug!("No live session for {}; dropping {:?}", ctx, signal),
    }
}

/// Runs the account's housekeeping poll at whatever interval the engine last
/// asked for; an interval of zero parks the task until it changes
async fn poll_timer(inner: Weak<ManagerInner>, account_id: String, mut interval: watch::Receiver<u64>) {
    loop {
        let seconds = *interval.borrow_and_update();
        if seconds == 0 {
            if interval.changed().await.is_err() {
                break;
            }
            continue;
        }

        tokio::select! {
            changed = interval.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            () = tokio::time::sleep(Duration::from_secs(seconds)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Manager { inner }.poll(&account_id);
            }
        }
    }
    log::debug!("Poll timer of {} stopped", account_id);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::wire::QUERY_MESSAGE;
    use crate::session::DecryptResult;
    use tempfile::TempDir;

    fn account() -> AccountIdentity {
        AccountIdentity::new("acct", "alice@example.org", "jabber")
    }

    fn manager(dir: &TempDir) -> Manager {
        Manager::with_settings(dir.path(), Policy::Opportunistic, EngineSettings::default())
    }

    #[test]
    fn test_engine_state_is_lazy_singleton() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.engine_state(&account()).unwrap();
        let second = manager.engine_state(&account()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.has_private_key());
        assert!(first.paths().instance_tags().exists());

        // A fresh manager reloads the same instance tag
        let tag = first.instance_tag();
        let reloaded = Manager::with_settings(dir.path(), Policy::Never, EngineSettings::default());
        assert_eq!(reloaded.instance_tag(&account()).unwrap(), tag);
    }

    #[test]
    fn test_policy_is_global_and_mutable() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let clone = manager.clone();

        assert_eq!(manager.policy(), Policy::Opportunistic);
        clone.set_policy(Policy::Always);
        assert_eq!(manager.policy(), Policy::Always);
    }

    #[test]
    fn test_one_session_per_conversation() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let session = manager.create_session(&account(), "bob").unwrap();
        assert!(manager.create_session(&account(), "bob").is_err());
        assert!(manager.create_session(&account(), "john").is_ok());

        drop(session);
        assert!(manager.create_session(&account(), "bob").is_ok());
    }

    #[test]
    fn test_trust_and_forget_unknown_fingerprint() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let value = FingerprintValue::from_bytes([7u8; 20]);

        assert!(!manager.trust_fingerprint(&account(), "bob", &value, true).unwrap());
        assert!(!manager.forget_fingerprint(&account(), "bob", &value).unwrap());
        assert!(manager.known_fingerprints(&account()).unwrap().is_empty());
    }

    #[test]
    fn test_deferred_queue_is_fifo() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let ctx = SessionContext::new(&account(), "bob");

        assert!(!manager.has_deferred(&ctx));
        manager.defer(&ctx, Deferred::Outgoing(Message::outgoing("one")));
        manager.defer(&ctx, Deferred::Incoming(Message::incoming("two")));
        assert!(manager.has_deferred(&ctx));

        let queue: Vec<_> = manager.take_deferred(&ctx).into_iter().collect();
        assert!(matches!(&queue[0], Deferred::Outgoing(m) if m.text == "one"));
        assert!(matches!(&queue[1], Deferred::Incoming(m) if m.text == "two"));
        assert!(!manager.has_deferred(&ctx));
    }

    #[test]
    fn test_key_generation_needs_runtime() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(!manager.create_new_private_key(&account()));
        assert!(!manager.is_generating_key("acct"));
    }

    #[tokio::test]
    async fn test_key_generation_single_flight() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let mut events = manager.subscribe();

        assert!(manager.create_new_private_key(&account()));
        assert!(!manager.create_new_private_key(&account()));
        assert!(manager.is_generating_key("acct"));

        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::KeyGenerationStarted {
                account_id: "acct".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::KeyGenerationFinished {
                account_id: "acct".to_string(),
                error: false
            }
        );

        assert!(!manager.is_generating_key("acct"));
        let fingerprint = manager.fingerprint_for_account(&account()).unwrap().unwrap();
        let state = manager.engine_state(&account()).unwrap();
        let stored = storage::read_private_key(state.paths()).unwrap().unwrap();
        assert_eq!(stored.fingerprint(), fingerprint);
    }

    /// Put a directory where the key file goes so writing the key fails
    fn block_key_file(manager: &Manager) -> PathBuf {
        let state = manager.engine_state(&account()).unwrap();
        let target = state.paths().private_key();
        std::fs::create_dir_all(target.join("occupied")).unwrap();
        target
    }

    #[tokio::test]
    async fn test_failed_key_generation_is_not_retried_automatically() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let blocked = block_key_file(&manager);
        let mut events = manager.subscribe();
        let mut session = manager.create_session(&account(), "bob").unwrap();

        // The query waits for a key
        let result = session.decrypt(&mut Message::incoming(QUERY_MESSAGE));
        assert_eq!(result, DecryptResult::Otr);
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagerEvent::KeyGenerationStarted { .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::KeyGenerationFinished {
                account_id: "acct".to_string(),
                error: true
            }
        );
        assert!(manager.key_generation_failed("acct"));

        // Without an explicit retry the next query is rejected, not deferred
        let result = session.decrypt(&mut Message::incoming(QUERY_MESSAGE));
        assert_eq!(result, DecryptResult::Error);
        assert!(!manager.is_generating_key("acct"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());

        // An explicit request clears the failure
        std::fs::remove_dir_all(&blocked).unwrap();
        assert!(manager.create_new_private_key(&account()));
        assert!(!manager.key_generation_failed("acct"));
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagerEvent::KeyGenerationStarted { .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::KeyGenerationFinished {
                account_id: "acct".to_string(),
                error: false
            }
        );
        assert!(manager.fingerprint_for_account(&account()).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_runs_at_requested_interval() {
        let dir = TempDir::new().unwrap();
        let settings = EngineSettings {
            poll_interval: Duration::from_secs(5),
            ..EngineSettings::default()
        };
        let manager = Manager::with_settings(dir.path(), Policy::Opportunistic, settings);
        let alice = account();
        let paths = AccountPaths::new(dir.path(), &alice.account_id);
        storage::write_private_key(&paths, &alice, &PrivateKey::generate()).unwrap();
        let state = manager.engine_state(&alice).unwrap();
        let mut session = manager.create_session(&alice, "bob").unwrap();

        // An offered key exchange is pending, so the engine wants polling
        let result = session.decrypt(&mut Message::incoming(QUERY_MESSAGE));
        assert_eq!(result, DecryptResult::Otr);
        assert_eq!(state.poll_interval(), 5);
        settle().await;

        // Closing the session drops the pending exchange; only the next poll
        // notices that no polling is needed any more
        drop(session);
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(state.poll_interval(), 5);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(state.poll_interval(), 0);
    }

    /// Let spawned tasks catch up without moving the paused clock
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_shutdown_saves_fingerprints() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let state = manager.engine_state(&account()).unwrap();
        manager.shutdown();
        assert!(state.paths().fingerprints().exists());
    }
}
