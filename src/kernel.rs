//! The security kernel facade.
//!
//! [`SecurityKernel`] wires the MAC engine, envelope cipher, flow validator,
//! signer, key lifecycle and audit chain around one lattice, one keyring and
//! one audit sink. [`SecurityKernel::start`] spawns the audit writer and the
//! rotation scheduler; [`SecurityKernel::shutdown`] stops both and waits for
//! the final audit flush.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::chain::{AuditChain, ChainVerification};
use crate::audit::event::{AuditContext, AuditEvent, AuditEventType};
use crate::audit::sink::{run_audit_writer, AuditSink, ChannelSink};
use crate::config::KernelConfig;
use crate::context::{ContextHandle, SecurityContext};
use crate::crypto::domain::DomainCache;
use crate::crypto::envelope::{EncryptedEntity, EncryptedEnvelope, EnvelopeCipher};
use crate::crypto::keyring::Keyring;
use crate::error::KernelError;
use crate::flow::{FlowValidator, FlowViolation, LineageRecord};
use crate::label::{Entity, Lattice, SecurityLabel};
use crate::mac::{AccessDenied, MacEngine};
use crate::policy::{AuditPolicy, PolicySource};
use crate::signing::rotation::{KeyHistoryEntry, KeyLifecycle, RotationError};
use crate::signing::signer::{ActionPayload, ActionSignature, NonRepudiationSigner, SignerError};
use crate::store::{DurableStore, SqliteStore};

struct Background {
    audit_rx: Option<mpsc::Receiver<AuditEvent>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// One security kernel instance.
pub struct SecurityKernel {
    config: KernelConfig,
    lattice: Arc<Lattice>,
    context: ContextHandle,
    mac: MacEngine,
    flow: FlowValidator,
    cipher: EnvelopeCipher,
    signer: Arc<NonRepudiationSigner>,
    lifecycle: Arc<KeyLifecycle>,
    chain: Arc<AuditChain>,
    sink: Arc<ChannelSink>,
    background: Mutex<Background>,
}

impl std::fmt::Debug for SecurityKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityKernel")
            .field("levels", &self.lattice.levels())
            .field("chain", &self.chain)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl SecurityKernel {
    /// Build a kernel. No background task runs until [`SecurityKernel::start`].
    ///
    /// `policy` takes precedence over the `[policy]` config section. With
    /// neither, auditing is strict and signatures are required.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid lattice configuration.
    pub fn new(
        config: KernelConfig,
        keyring: Arc<dyn Keyring>,
        policy: Option<&dyn PolicySource>,
    ) -> Result<Self, KernelError> {
        let lattice = Arc::new(config.build_lattice()?);
        let config_policy = config.policy.policy_source();
        let source = policy.or(config_policy.as_ref().map(|p| p as &dyn PolicySource));
        let audit_policy = AuditPolicy::resolve(source, config.policy.environment());

        let (sink, audit_rx) = ChannelSink::channel(config.audit.channel_capacity);
        let sink = Arc::new(sink);
        let dyn_sink: Arc<dyn AuditSink> = Arc::clone(&sink) as Arc<dyn AuditSink>;
        let domains = Arc::new(DomainCache::new(config.cache.domain_capacity));

        let lifecycle = Arc::new(KeyLifecycle::new(
            Arc::clone(&keyring),
            Arc::clone(&dyn_sink),
            config.rotation.to_rotation_config(),
        ));
        let signer = Arc::new(NonRepudiationSigner::new(
            Arc::clone(&keyring),
            Arc::clone(&domains),
            Arc::clone(&dyn_sink),
        ));
        let chain = Arc::new(AuditChain::new(
            config.audit.buffer_capacity,
            Some(Arc::clone(&signer)),
            audit_policy,
            config.audit.limits(),
        ));
        let mac = MacEngine::new(
            Arc::clone(&lattice),
            config.cache.decision_capacity,
            Arc::clone(&dyn_sink),
            audit_policy,
        );
        let flow = FlowValidator::new(Arc::clone(&lattice), Arc::clone(&dyn_sink));
        let cipher = EnvelopeCipher::new(
            Arc::clone(&lattice),
            domains,
            keyring,
            Arc::clone(&lifecycle),
            dyn_sink,
            config.cache.key_capacity,
        );

        let (shutdown_tx, _) = watch::channel(false);
        info!(
            environment = %audit_policy.environment(),
            levels = lattice.levels().len(),
            "security kernel initialised"
        );

        Ok(Self {
            context: ContextHandle::new(Arc::clone(&lattice)),
            config,
            lattice,
            mac,
            flow,
            cipher,
            signer,
            lifecycle,
            chain,
            sink,
            background: Mutex::new(Background {
                audit_rx: Some(audit_rx),
                shutdown_tx,
                handles: Vec::new(),
            }),
        })
    }

    /// Build a kernel and attach the SQLite store named in the config.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid lattice or an unusable database.
    pub async fn open(
        config: KernelConfig,
        keyring: Arc<dyn Keyring>,
        policy: Option<&dyn PolicySource>,
    ) -> Result<Self, KernelError> {
        let db_path = config.audit.db_path.clone();
        let kernel = Self::new(config, keyring, policy)?;
        if let Some(path) = db_path {
            let store = SqliteStore::open(&path).await?;
            kernel.attach_store(Arc::new(store)).await?;
        }
        Ok(kernel)
    }

    /// Attach durable storage for the audit chain and key history.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub async fn attach_store(&self, store: Arc<dyn DurableStore>) -> Result<(), KernelError> {
        self.lifecycle.attach_store(Arc::clone(&store)).await?;
        self.chain.attach_store(store).await?;
        Ok(())
    }

    /// Spawn the audit writer and, if enabled, the rotation scheduler.
    ///
    /// Must be called inside a Tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        let Ok(mut background) = self.background.lock() else {
            warn!("kernel background state poisoned, not starting");
            return;
        };
        let Some(audit_rx) = background.audit_rx.take() else {
            return;
        };
        let writer = tokio::spawn(run_audit_writer(
            Arc::clone(&self.chain),
            audit_rx,
            self.config.audit.flush_interval(),
            background.shutdown_tx.subscribe(),
        ));
        background.handles.push(writer);

        if self.config.rotation.enabled {
            let scheduler = tokio::spawn(
                Arc::clone(&self.lifecycle).run_scheduler(background.shutdown_tx.subscribe()),
            );
            background.handles.push(scheduler);
        }
        info!("security kernel started");
    }

    /// Stop background tasks and wait for the final audit flush.
    pub async fn shutdown(&self) {
        let handles = match self.background.lock() {
            Ok(mut background) => {
                let _ = background.shutdown_tx.send(true);
                std::mem::take(&mut background.handles)
            }
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "kernel task ended abnormally");
            }
        }
        info!(
            buffered = self.chain.buffered(),
            evicted = self.chain.evicted(),
            dropped = self.sink.dropped(),
            "security kernel stopped"
        );
    }

    // -- Context ------------------------------------------------------------

    /// Session context handle.
    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    /// Authenticate `user_id` at `label` for the configured TTL.
    pub fn login(&self, user_id: &str, label: SecurityLabel) {
        self.context
            .set_context(user_id, label.clone(), self.config.context.ttl());
        self.emit_context_change("login", Some(user_id), Some(&label));
    }

    /// Install a fully specified context.
    pub fn set_context(&self, context: SecurityContext) {
        let user_id = context.user_id.clone();
        let label = context.label.clone();
        self.context.set_full_context(context);
        self.emit_context_change("replace", Some(&user_id), Some(&label));
    }

    /// Drop the active context.
    pub fn logout(&self) {
        let user = self.context.current().map(|c| c.user_id.clone());
        self.context.clear();
        self.emit_context_change("logout", user.as_deref(), None);
    }

    /// Current subject label (least-privileged when none is active).
    pub fn subject(&self) -> SecurityLabel {
        self.context.subject()
    }

    // -- MAC ----------------------------------------------------------------

    /// MAC engine.
    pub fn mac(&self) -> &MacEngine {
        &self.mac
    }

    /// Whether `subject` may read `object`.
    pub fn can_read(&self, subject: &SecurityLabel, object: &SecurityLabel) -> bool {
        self.mac.can_read(subject, object)
    }

    /// Whether `subject` may write `object`.
    pub fn can_write(&self, subject: &SecurityLabel, object: &SecurityLabel) -> bool {
        self.mac.can_write(subject, object)
    }

    /// Require that the current subject may read `object`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] on a read-up.
    pub fn enforce_read(&self, object: &SecurityLabel) -> Result<(), AccessDenied> {
        self.mac.enforce_no_read_up(&self.subject(), object)
    }

    /// Require that the current subject may write `object`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] on a write-down.
    pub fn enforce_write(&self, object: &SecurityLabel) -> Result<(), AccessDenied> {
        self.mac.enforce_no_write_down(&self.subject(), object)
    }

    /// Effective label of a record.
    pub fn label_of(&self, entity: &Entity) -> SecurityLabel {
        self.lattice.label_of(entity)
    }

    // -- Crypto -------------------------------------------------------------

    /// Envelope cipher.
    pub fn cipher(&self) -> &EnvelopeCipher {
        &self.cipher
    }

    /// Seal bytes under `label`'s domain.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeCipher::encrypt`].
    pub async fn encrypt(&self, label: &SecurityLabel, plaintext: &[u8]) -> Result<EncryptedEnvelope, KernelError> {
        Ok(self.cipher.encrypt(label, plaintext).await?)
    }

    /// Open an envelope sealed under `label`'s domain.
    ///
    /// # Errors
    ///
    /// See [`EnvelopeCipher::decrypt`].
    pub async fn decrypt(&self, label: &SecurityLabel, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, KernelError> {
        Ok(self.cipher.decrypt(label, envelope).await?)
    }

    /// Seal a record after checking the current subject may write it.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AccessDenied`] on a write-down, otherwise as
    /// [`EnvelopeCipher::encrypt_entity`].
    pub async fn seal(&self, entity: &Entity) -> Result<EncryptedEntity, KernelError> {
        self.enforce_write(&self.lattice.label_of(entity))?;
        Ok(self.cipher.encrypt_entity(entity).await?)
    }

    /// Open a sealed record after checking the current subject may read it.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::AccessDenied`] on a read-up, otherwise as
    /// [`EnvelopeCipher::decrypt_entity`].
    pub async fn open_sealed(&self, sealed: &EncryptedEntity) -> Result<Value, KernelError> {
        self.enforce_read(&sealed.label)?;
        Ok(self.cipher.decrypt_entity(sealed).await?)
    }

    /// Daily access hint for `label`.
    pub fn access_hint(&self, label: &SecurityLabel, at: DateTime<Utc>) -> Option<String> {
        self.cipher.access_hint(label, at)
    }

    // -- Flow ---------------------------------------------------------------

    /// Flow validator.
    pub fn flow(&self) -> &FlowValidator {
        &self.flow
    }

    /// Check a derivation, attributed to the current subject.
    ///
    /// # Errors
    ///
    /// Returns [`FlowViolation`] when the derivation is not permitted.
    pub fn derived(
        &self,
        sources: &[SecurityLabel],
        derived: &SecurityLabel,
        metadata: Value,
    ) -> Result<LineageRecord, FlowViolation> {
        self.flow
            .derived_in(sources, derived, metadata, self.audit_context())
    }

    // -- Signing & keys -----------------------------------------------------

    /// Non-repudiation signer.
    pub fn signer(&self) -> &NonRepudiationSigner {
        &self.signer
    }

    /// Sign an action.
    ///
    /// # Errors
    ///
    /// See [`NonRepudiationSigner::sign_action`].
    pub async fn sign_action(
        &self,
        user_id: &str,
        action: &str,
        label: &SecurityLabel,
    ) -> Result<ActionSignature, SignerError> {
        self.signer.sign_action(user_id, action, label).await
    }

    /// Verify an action signature against the label domain's key; never errors.
    pub async fn verify_signature(
        &self,
        signature: &ActionSignature,
        payload: &ActionPayload,
        public_key: Option<&VerifyingKey>,
    ) -> bool {
        self.signer.verify_signature(signature, payload, public_key).await
    }

    /// Key lifecycle.
    pub fn lifecycle(&self) -> &KeyLifecycle {
        &self.lifecycle
    }

    /// Rotate envelope keys now.
    ///
    /// # Errors
    ///
    /// See [`KeyLifecycle::rotate_keys`].
    pub async fn rotate_keys(&self, reason: &str) -> Result<KeyHistoryEntry, RotationError> {
        self.lifecycle.rotate_keys(reason).await
    }

    /// Rotate immediately and restart the schedule.
    ///
    /// # Errors
    ///
    /// See [`KeyLifecycle::emergency_rotation`].
    pub async fn emergency_rotation(&self, reason: &str) -> Result<KeyHistoryEntry, RotationError> {
        self.lifecycle.emergency_rotation(reason).await
    }

    /// Drop cached key material and rotation history.
    pub fn destroy_keys(&self) {
        self.cipher.destroy_keys();
        self.signer.forget_keys();
        self.lifecycle.destroy();
        warn!("key material and history destroyed");
        self.sink.emit(
            AuditEvent::new(
                AuditEventType::KeysDestroyed,
                json!({ "active_version": self.lifecycle.active_version() }),
            )
            .with_context(self.audit_context()),
        );
    }

    // -- Audit --------------------------------------------------------------

    /// Audit chain.
    pub fn audit_chain(&self) -> &AuditChain {
        &self.chain
    }

    /// Flush buffered audit envelopes now.
    ///
    /// # Errors
    ///
    /// See [`AuditChain::flush`].
    pub async fn flush_audit(&self) -> Result<usize, KernelError> {
        Ok(self.chain.flush().await?)
    }

    /// Verify the audit chain.
    ///
    /// # Errors
    ///
    /// See [`AuditChain::verify_chain`].
    pub async fn verify_chain(&self) -> Result<ChainVerification, KernelError> {
        Ok(self.chain.verify_chain().await?)
    }

    /// Events dropped because the audit channel was full.
    pub fn dropped_audit_events(&self) -> u64 {
        self.sink.dropped()
    }

    fn audit_context(&self) -> AuditContext {
        match self.context.current() {
            Some(ctx) => AuditContext {
                user_id: Some(ctx.user_id.clone()),
                tenant_id: Some(ctx.tenant_id.clone()),
                correlation_id: None,
            },
            None => AuditContext::default(),
        }
    }

    fn emit_context_change(&self, action: &str, user_id: Option<&str>, label: Option<&SecurityLabel>) {
        self.sink.emit(
            AuditEvent::new(
                AuditEventType::ContextChange,
                json!({ "action": action, "label": label }),
            )
            .with_context(AuditContext {
                user_id: user_id.map(str::to_owned),
                ..AuditContext::default()
            }),
        );
    }
}
