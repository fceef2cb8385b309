//! Per-party CellCNN state: cleartext and encrypted weights, their previous
//! updates, and the local training step.

use std::sync::Arc;

use cellcnn_ckks::{CkksScheme, Leveled};
use log::debug;
use rand_chacha::ChaCha20Rng;

use crate::backward::{
    backward_encrypted, backward_plain, BackwardInputs, EncryptedGradient, Masks, PlainGradient,
};
use crate::config::CnnConfig;
use crate::context::{CryptoContext, LevelPlan};
use crate::dataset::Batch;
use crate::encoding::{conv_weight_slots, dense_weight_slots, encode_left};
use crate::error::{CnnError, ConfigError, Result};
use crate::forward::{forward_encrypted, forward_plain};
use crate::layout::Layout;
use crate::matrix::Matrix;
use crate::refresh::{repack, Refresher};
use crate::rng::init_weights;

/// Cleartext weights and the last applied update.
#[derive(Debug, Clone, PartialEq)]
pub struct PlainState {
    /// Convolution weights, `features × filters`.
    pub c: Matrix,
    /// Dense weights, `filters × classes`.
    pub w: Matrix,
    pub prev: Option<PlainGradient>,
}

/// Encrypted weights and the last applied update, at the weights level.
#[derive(Clone)]
pub struct EncryptedState<C> {
    pub c: C,
    pub w: C,
    pub prev: Option<EncryptedGradient<C>>,
}

pub struct CellCnn<S: CkksScheme> {
    config: CnnConfig,
    layout: Layout,
    plan: LevelPlan,
    ctx: Arc<CryptoContext<S>>,
    masks: Masks<S::Plaintext>,
    rng: ChaCha20Rng,
    plain: Option<PlainState>,
    encrypted: Option<EncryptedState<S::Ciphertext>>,
}

impl<S: CkksScheme> CellCnn<S> {
    /// Validates the configuration against the context before building
    /// anything.
    pub fn new(config: CnnConfig, ctx: Arc<CryptoContext<S>>, rng: ChaCha20Rng) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let available = ctx.params().slots();
        if layout.used_slots() > available {
            return Err(ConfigError::SlotOverflow {
                needed: layout.used_slots(),
                available,
            }
            .into());
        }
        let plan = LevelPlan::new(ctx.max_level())?;
        let masks = Masks::build(&*ctx, &layout, &plan)?;
        Ok(Self {
            config,
            layout,
            plan,
            ctx,
            masks,
            rng,
            plain: None,
            encrypted: None,
        })
    }

    pub fn config(&self) -> &CnnConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn plan(&self) -> &LevelPlan {
        &self.plan
    }

    pub fn context(&self) -> &Arc<CryptoContext<S>> {
        &self.ctx
    }

    pub fn rng(&mut self) -> &mut ChaCha20Rng {
        &mut self.rng
    }

    /// `learning_rate / n_parties`, the share of the step each party
    /// contributes.
    pub fn lr_factor(&self) -> f64 {
        self.config.learning_rate / self.config.n_parties as f64
    }

    pub fn plain_state(&self) -> Option<&PlainState> {
        self.plain.as_ref()
    }

    pub fn encrypted_state(&self) -> Option<&EncryptedState<S::Ciphertext>> {
        self.encrypted.as_ref()
    }

    /// Draw fresh weights with variance scaled by the fan-in and install
    /// them as the cleartext state.
    pub fn init_weights(&mut self) -> Result<(Matrix, Matrix)> {
        let c = init_weights(&mut self.rng, self.layout.features, self.layout.filters);
        let w = init_weights(&mut self.rng, self.layout.filters, self.layout.classes);
        self.set_weights(c.clone(), w.clone())?;
        Ok((c, w))
    }

    pub fn set_weights(&mut self, c: Matrix, w: Matrix) -> Result<()> {
        check_shape(&c, (self.layout.features, self.layout.filters), "set_weights")?;
        check_shape(&w, (self.layout.filters, self.layout.classes), "set_weights")?;
        self.plain = Some(PlainState { c, w, prev: None });
        Ok(())
    }

    /// Encrypt the cleartext weights at the weights level.
    pub fn encrypt_weights(&mut self) -> Result<()> {
        let state = self.plain.as_ref().ok_or(CnnError::MissingState("cleartext weights"))?;
        let level = self.plan.weights();
        let c = self.ctx.encrypt(&conv_weight_slots(&state.c, &self.layout)?, level, &mut self.rng)?;
        let w = self.ctx.encrypt(&dense_weight_slots(&state.w, &self.layout)?, level, &mut self.rng)?;
        self.encrypted = Some(EncryptedState { c, w, prev: None });
        Ok(())
    }

    /// Install encrypted weights received from the root, keeping any
    /// previous update this party holds.
    pub fn set_encrypted_weights(&mut self, c: S::Ciphertext, w: S::Ciphertext) {
        let prev = self.encrypted.take().and_then(|e| e.prev);
        self.encrypted = Some(EncryptedState { c, w, prev });
    }

    /// Install cleartext weights received from the root, keeping any
    /// previous update this party holds.
    pub fn set_plain_weights(&mut self, c: Matrix, w: Matrix) -> Result<()> {
        let prev = self.plain.take().and_then(|p| p.prev);
        self.set_weights(c, w)?;
        if let Some(state) = self.plain.as_mut() {
            state.prev = prev;
        }
        Ok(())
    }

    /// Local cleartext gradient on `batch`. With `with_momentum` the
    /// momentum-scaled previous update is folded in, which exactly one
    /// contributor (the root) does per iteration.
    pub fn plain_step(&self, batch: &Batch, with_momentum: bool) -> Result<PlainGradient> {
        let state = self.plain.as_ref().ok_or(CnnError::MissingState("cleartext weights"))?;
        let fwd = forward_plain(&batch.x, &state.c, &state.w)?;
        let g = backward_plain(&batch.x, &batch.y, &fwd, &state.w, self.config.activation, self.lr_factor())?;
        match (&state.prev, with_momentum) {
            (Some(prev), true) => g.with_momentum(prev, self.config.momentum),
            _ => Ok(g),
        }
    }

    /// Local encrypted gradient on `batch`: forward, repack, refresh,
    /// backward.
    pub fn encrypted_step(
        &mut self,
        batch: &Batch,
        refresher: &dyn Refresher<S>,
        with_momentum: bool,
    ) -> Result<EncryptedGradient<S::Ciphertext>> {
        let ctx = Arc::clone(&self.ctx);
        let state = self.encrypted.as_ref().ok_or(CnnError::MissingState("encrypted weights"))?;
        let layout = self.layout;
        let eval = ctx.evaluator();

        let x = encode_left(&batch.x, layout.filters, 1.0)?
            .iter()
            .map(|v| ctx.encode_for_product(v, state.c.level()))
            .collect::<Result<Vec<_>>>()?;
        let fwd = forward_encrypted(&eval, &layout, &x, &state.c, &state.w)?;

        let prev = if with_momentum { state.prev.as_ref() } else { None };
        let boot = repack(
            &eval,
            &layout,
            &fwd,
            &state.w,
            prev.map(|p| &p.dw),
            prev.map(|p| &p.dc),
        )?;
        debug!("repacked at level {}", boot.level());
        let boot = refresher.refresh(&*ctx, &boot, &layout, &mut self.rng)?;

        let input = BackwardInputs {
            layout: &layout,
            masks: &self.masks,
            activation: self.config.activation,
            x: &batch.x,
            y: &batch.y,
            lr_factor: self.lr_factor(),
            with_momentum: with_momentum && prev.is_some(),
        };
        backward_encrypted(&*ctx, &boot, &input)
    }

    /// `C −= ΔC`, `W −= ΔW`; `total` becomes the previous update.
    pub fn apply_plain_update(&mut self, total: PlainGradient) -> Result<()> {
        let state = self.plain.as_mut().ok_or(CnnError::MissingState("cleartext weights"))?;
        state.c = state.c.sub(&total.dc)?;
        state.w = state.w.sub(&total.dw)?;
        state.prev = Some(total);
        Ok(())
    }

    pub fn apply_encrypted_update(&mut self, total: EncryptedGradient<S::Ciphertext>) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let eval = ctx.evaluator();
        let state = self.encrypted.as_mut().ok_or(CnnError::MissingState("encrypted weights"))?;
        state.c = eval.sub(&state.c, &total.dc)?;
        state.w = eval.sub(&state.w, &total.dw)?;
        state.prev = Some(total);
        Ok(())
    }

    /// One single-party iteration on whichever weight forms are present.
    pub fn train_iteration(&mut self, batch: &Batch, refresher: &dyn Refresher<S>) -> Result<()> {
        if self.plain.is_some() {
            let g = self.plain_step(batch, true)?;
            self.apply_plain_update(g)?;
        }
        if self.encrypted.is_some() {
            let g = self.encrypted_step(batch, refresher, true)?;
            self.apply_encrypted_update(g)?;
        }
        Ok(())
    }
}

fn check_shape(m: &Matrix, expected: (usize, usize), op: &'static str) -> Result<()> {
    if m.shape() != expected {
        return Err(CnnError::ShapeMismatch {
            op,
            left: m.shape(),
            right: expected,
        });
    }
    Ok(())
}
