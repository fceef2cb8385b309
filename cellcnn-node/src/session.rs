//! Per-party session: sync, then iterate until the root has run every
//! global iteration.
//!
//! ```text
//! Created → Synced → Iterating(n)* → Reporting → Done
//! ```
//!
//! The root samples its own shard like every other party, folds the
//! momentum term into its own contribution, sums the contributions of its
//! subtree, updates the weights and broadcasts them. Every other party
//! installs the broadcast weights, computes its local update, adds the
//! updates of its children and sends the sum to its parent.

use std::sync::Arc;
use std::time::Duration;

use cellcnn::rng::SampleSampler;
use cellcnn::{
    Batch, CellCnn, CnnError, CollectiveRefresh, ConfigError, EncryptedGradient, Matrix, PlainGradient,
    Sample,
};
use cellcnn_ckks::{CkksScheme, Leveled};
use log::{debug, error, info};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::transport::Endpoint;
use crate::wire::{matrix_blob, matrix_from_blob, Frame, GradientMsg, IterationMsg, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyState {
    Created,
    Synced,
    Iterating(u64),
    Reporting,
    Done,
}

/// Final weights reported by the root.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub iterations: u64,
    /// Cleartext weights, when cleartext training ran.
    pub c: Option<Matrix>,
    pub w: Option<Matrix>,
    /// Decrypted encrypted weights, when encrypted training ran.
    pub decrypted_c: Option<Matrix>,
    pub decrypted_w: Option<Matrix>,
}

/// Sum of the updates of a subtree.
struct Contribution<C> {
    plain: Option<PlainGradient>,
    encrypted: Option<EncryptedGradient<C>>,
}

pub struct Party<S: CkksScheme> {
    id: usize,
    model: CellCnn<S>,
    shard: Vec<Sample>,
    sampler: SampleSampler,
    endpoint: Endpoint,
    refresher: CollectiveRefresh<S>,
    secret: S::SecretKey,
    session: SessionConfig,
    max_iterations: u64,
    state: PartyState,
}

impl<S: CkksScheme + 'static> Party<S> {
    /// `secret` is the collective key the refresh decrypts with; the root
    /// also uses it to decrypt the final weights for its report.
    pub fn new(
        model: CellCnn<S>,
        shard: Vec<Sample>,
        endpoint: Endpoint,
        secret: S::SecretKey,
        session: SessionConfig,
    ) -> std::result::Result<Self, ConfigError> {
        if shard.is_empty() {
            return Err(ConfigError::TooSmall {
                field: "shard",
                min: 1,
                value: 0,
            });
        }
        let refresher = CollectiveRefresh::new(secret.clone(), model.config());
        Ok(Self {
            id: endpoint.id,
            sampler: SampleSampler::new(shard.len()),
            max_iterations: model.config().max_iterations() as u64,
            model,
            shard,
            endpoint,
            refresher,
            secret,
            session,
            state: PartyState::Created,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> PartyState {
        self.state
    }

    /// Run the session to completion. The root returns its report; other
    /// parties return `None`. Any error aborts this party and is logged
    /// once.
    pub async fn run(mut self) -> Result<Option<TrainingReport>> {
        let result = self.drive().await;
        if let Err(e) = &result {
            error!(
                "party={} iter={} kind={} detail={}",
                self.id,
                self.iteration(),
                e.kind(),
                e
            );
        }
        result
    }

    fn iteration(&self) -> u64 {
        match self.state {
            PartyState::Iterating(n) => n,
            PartyState::Reporting | PartyState::Done => self.max_iterations,
            PartyState::Created | PartyState::Synced => 0,
        }
    }

    fn timeout(&self) -> Duration {
        self.session.timeout
    }

    async fn drive(&mut self) -> Result<Option<TrainingReport>> {
        self.sync().await?;
        self.state = PartyState::Synced;
        if self.endpoint.is_root() {
            let report = self.lead().await?;
            Ok(Some(report))
        } else {
            self.follow().await?;
            Ok(None)
        }
    }

    /// `Sync` travels down the tree, acknowledgements travel back up.
    async fn sync(&mut self) -> Result<()> {
        let t = self.timeout();
        if !self.endpoint.is_root() {
            self.endpoint.expect_from_parent(MessageType::Sync, t).await?;
        }
        let sync = Frame::new(MessageType::Sync, Vec::new());
        self.endpoint.broadcast(&sync)?;
        for _ in 0..self.endpoint.children.len() {
            let (_, bytes) = self.endpoint.recv_from_child(t).await?;
            let (frame, _) = Frame::decode(&bytes)?;
            if frame.msg_type != MessageType::Sync {
                return Err(SessionError::UnexpectedMessage {
                    want: MessageType::Sync,
                    got: frame.msg_type,
                });
            }
        }
        if !self.endpoint.is_root() {
            self.endpoint.send_to_parent(&sync)?;
        }
        debug!("party {} synced", self.id);
        Ok(())
    }

    async fn lead(&mut self) -> Result<TrainingReport> {
        let t = self.timeout();
        let max = self.max_iterations;

        self.model.init_weights()?;
        if self.session.train_encrypted {
            self.model.encrypt_weights()?;
        }
        self.endpoint.broadcast(&self.iteration_msg(0, true)?.to_frame())?;

        for n in 0..max {
            self.state = PartyState::Iterating(n);
            if self.endpoint.cancelled() {
                return Err(SessionError::Cancelled);
            }

            let mut total = self.local_contribution(true)?;
            let mut aggregated = 1;
            for _ in 0..self.endpoint.children.len() {
                let (child, bytes) = self.endpoint.recv_from_child(t).await?;
                match self.decode_contribution(&bytes) {
                    Ok(c) => {
                        total = self.combine(total, c)?;
                        aggregated += 1;
                    }
                    Err(e) => error!(
                        "party={} iter={} kind={} detail=dropped contribution of party {}: {}",
                        self.id,
                        n,
                        e.kind(),
                        child,
                        e
                    ),
                }
            }
            self.apply(total)?;
            info!("iteration {}/{} aggregated {} contributions", n + 1, max, aggregated);

            let msg = self.iteration_msg(n + 1, self.session.train_plain)?;
            self.endpoint.broadcast(&msg.to_frame())?;
        }

        self.state = PartyState::Reporting;
        let report = self.report()?;
        self.state = PartyState::Done;
        Ok(report)
    }

    async fn follow(&mut self) -> Result<()> {
        let t = self.timeout();
        loop {
            let frame = self.endpoint.expect_from_parent(MessageType::Iteration, t).await?;
            let msg = IterationMsg::decode(&frame.payload)?;
            self.endpoint.broadcast(&frame)?;
            self.install(&msg)?;
            if msg.n >= self.max_iterations {
                break;
            }

            self.state = PartyState::Iterating(msg.n);
            if self.endpoint.cancelled() {
                return Err(SessionError::Cancelled);
            }
            let mut total = self.local_contribution(false)?;
            for _ in 0..self.endpoint.children.len() {
                let (_, bytes) = self.endpoint.recv_from_child(t).await?;
                let c = self.decode_contribution(&bytes)?;
                total = self.combine(total, c)?;
            }
            self.endpoint.send_to_parent(&self.gradient_msg(&total)?.to_frame())?;
        }
        self.state = PartyState::Done;
        debug!("party {} done after {} iterations", self.id, self.max_iterations);
        Ok(())
    }

    /// Sample a batch from the shard and run the enabled training paths.
    fn local_contribution(&mut self, with_momentum: bool) -> Result<Contribution<S::Ciphertext>> {
        let batch_size = self.model.config().batch_size;
        let indices = self.sampler.next_batch(self.model.rng(), batch_size);
        let batch = Batch::gather(&self.shard, &indices)?;
        let plain = if self.session.train_plain {
            Some(self.model.plain_step(&batch, with_momentum)?)
        } else {
            None
        };
        let encrypted = if self.session.train_encrypted {
            Some(self.model.encrypted_step(&batch, &self.refresher, with_momentum)?)
        } else {
            None
        };
        Ok(Contribution { plain, encrypted })
    }

    fn combine(
        &self,
        a: Contribution<S::Ciphertext>,
        b: Contribution<S::Ciphertext>,
    ) -> Result<Contribution<S::Ciphertext>> {
        let plain = match (a.plain, b.plain) {
            (Some(x), Some(y)) => Some(x.add(&y)?),
            (x, y) => x.or(y),
        };
        let ctx = Arc::clone(self.model.context());
        let eval = ctx.evaluator();
        let encrypted = match (a.encrypted, b.encrypted) {
            (Some(x), Some(y)) => Some(x.add(&eval, &y)?),
            (x, y) => x.or(y),
        };
        Ok(Contribution { plain, encrypted })
    }

    fn apply(&mut self, total: Contribution<S::Ciphertext>) -> Result<()> {
        if let Some(g) = total.plain {
            self.model.apply_plain_update(g)?;
        }
        if let Some(g) = total.encrypted {
            self.model.apply_encrypted_update(g)?;
        }
        Ok(())
    }

    fn iteration_msg(&self, n: u64, with_plain: bool) -> Result<IterationMsg> {
        let ctx = self.model.context();
        let plain = self.model.plain_state().filter(|_| with_plain);
        let encrypted = self.model.encrypted_state();
        Ok(IterationMsg {
            n,
            c: matrix_blob(plain.map(|p| &p.c)),
            w: matrix_blob(plain.map(|p| &p.w)),
            ct_c: encrypted.map(|e| ctx.ciphertext_to_bytes(&e.c)).transpose()?,
            ct_w: encrypted.map(|e| ctx.ciphertext_to_bytes(&e.w)).transpose()?,
        })
    }

    fn gradient_msg(&self, total: &Contribution<S::Ciphertext>) -> Result<GradientMsg> {
        let ctx = self.model.context();
        let plain = total.plain.as_ref();
        let encrypted = total.encrypted.as_ref();
        Ok(GradientMsg {
            dc: matrix_blob(plain.map(|g| &g.dc)),
            dw: matrix_blob(plain.map(|g| &g.dw)),
            ct_dc: encrypted.map(|g| ctx.ciphertext_to_bytes(&g.dc)).transpose()?,
            ct_dw: encrypted.map(|g| ctx.ciphertext_to_bytes(&g.dw)).transpose()?,
        })
    }

    /// Install the weights of an `Iteration` message. Every form the
    /// session trains must be present, except cleartext weights after the
    /// first iteration of an encrypted-only session.
    fn install(&mut self, msg: &IterationMsg) -> Result<()> {
        let c = matrix_from_blob(msg.c.as_deref())?;
        let w = matrix_from_blob(msg.w.as_deref())?;
        match (c, w) {
            (Some(c), Some(w)) => self.model.set_plain_weights(c, w)?,
            _ if self.session.train_plain => return Err(missing("cleartext weights")),
            _ => {}
        }
        if self.session.train_encrypted {
            let c = self.ciphertext(msg.ct_c.as_deref(), "ctC")?;
            let w = self.ciphertext(msg.ct_w.as_deref(), "ctW")?;
            self.model.set_encrypted_weights(c, w);
        }
        Ok(())
    }

    /// Decode a child's `LocalGradient` frame, checking every enabled form
    /// is present with the expected shape or level.
    fn decode_contribution(&self, bytes: &[u8]) -> Result<Contribution<S::Ciphertext>> {
        let (frame, _) = Frame::decode(bytes)?;
        if frame.msg_type != MessageType::LocalGradient {
            return Err(SessionError::UnexpectedMessage {
                want: MessageType::LocalGradient,
                got: frame.msg_type,
            });
        }
        let msg = GradientMsg::decode(&frame.payload)?;
        let layout = self.model.layout();

        let plain = if self.session.train_plain {
            let dc = matrix_from_blob(msg.dc.as_deref())?.ok_or_else(|| missing("ΔC"))?;
            let dw = matrix_from_blob(msg.dw.as_deref())?.ok_or_else(|| missing("ΔW"))?;
            if dc.shape() != (layout.features, layout.filters) || dw.shape() != (layout.filters, layout.classes) {
                return Err(CnnError::Serialization(format!(
                    "update shapes {:?} and {:?} do not match the model",
                    dc.shape(),
                    dw.shape()
                ))
                .into());
            }
            Some(PlainGradient { dc, dw })
        } else {
            None
        };
        let encrypted = if self.session.train_encrypted {
            Some(EncryptedGradient {
                dc: self.ciphertext(msg.ct_dc.as_deref(), "ctΔC")?,
                dw: self.ciphertext(msg.ct_dw.as_deref(), "ctΔW")?,
            })
        } else {
            None
        };
        Ok(Contribution { plain, encrypted })
    }

    /// Deserialize a weights-level ciphertext.
    fn ciphertext(&self, blob: Option<&[u8]>, what: &str) -> Result<S::Ciphertext> {
        let bytes = blob.ok_or_else(|| missing(what))?;
        let ct = self.model.context().ciphertext_from_bytes(bytes)?;
        let want = self.model.plan().weights();
        if ct.level() != want {
            return Err(CnnError::Serialization(format!(
                "{} at level {}, expected {}",
                what,
                ct.level(),
                want
            ))
            .into());
        }
        Ok(ct)
    }

    fn report(&self) -> Result<TrainingReport> {
        let plain = self.model.plain_state().filter(|_| self.session.train_plain);
        let (decrypted_c, decrypted_w) = if self.session.train_encrypted {
            let (c, w) = self.model.decrypt_weights(&self.secret)?;
            (Some(c), Some(w))
        } else {
            (None, None)
        };
        if self.session.train_plain && self.session.train_encrypted {
            info!("final ctC precision: {}", self.model.ctc_precision(&self.secret)?);
            info!("final ctW precision: {}", self.model.ctw_precision(&self.secret)?);
        }
        Ok(TrainingReport {
            iterations: self.max_iterations,
            c: plain.map(|p| p.c.clone()),
            w: plain.map(|p| p.w.clone()),
            decrypted_c,
            decrypted_w,
        })
    }
}

fn missing(what: &str) -> SessionError {
    CnnError::Serialization(format!("missing {}", what)).into()
}
