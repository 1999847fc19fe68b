// ─────────────────────────────────────────────────────────────────────
// SSC Kernel — Train/Eval Step Dispatcher
// ─────────────────────────────────────────────────────────────────────
//! Routes head output and target either through the enabled loss terms
//! (train) or through argmax prediction and optional persistence (eval).
//!
//! The two entry points return different types; [`StepDispatcher::step`]
//! wraps them behind a [`StepMode`] tag for callers that pick the mode at
//! runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use ssc_types::{ClassVolume, FrameKey, LabelVolume, LossFlags, SscConfig, SscError, SscResult};

use crate::loss::{LossInputs, LossKind, LossTerm, WeightedCrossEntropy};
use crate::persistence::{sink_from_config, PredictionSink};

/// Named loss values keyed by their result name (`loss_ssc`, ...).
pub type LossMap = BTreeMap<&'static str, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Train,
    Eval,
}

/// Argmax prediction paired with its ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalPayload {
    pub y_pred: LabelVolume,
    pub y_true: LabelVolume,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Losses(LossMap),
    Predictions(EvalPayload),
}

pub struct StepDispatcher {
    class_weights: Vec<f64>,
    flags: LossFlags,
    terms: BTreeMap<LossKind, Arc<dyn LossTerm>>,
    sink: Option<Arc<dyn PredictionSink>>,
}

impl StepDispatcher {
    /// Dispatcher for a head configuration.
    ///
    /// Cross-entropy defaults to [`WeightedCrossEntropy`]; the scalar
    /// terms must be registered with [`with_loss`](Self::with_loss) when
    /// enabled. The prediction sink follows `config.persistence`.
    pub fn new(config: &SscConfig) -> Self {
        let mut terms: BTreeMap<LossKind, Arc<dyn LossTerm>> = BTreeMap::new();
        terms.insert(LossKind::CrossEntropy, Arc::new(WeightedCrossEntropy));
        Self {
            class_weights: config.class_weights.clone(),
            flags: config.losses,
            terms,
            sink: config.persistence.as_ref().map(sink_from_config),
        }
    }

    pub fn with_loss(mut self, kind: LossKind, term: Arc<dyn LossTerm>) -> Self {
        self.terms.insert(kind, term);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PredictionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn without_sink(mut self) -> Self {
        self.sink = None;
        self
    }

    fn enabled(&self) -> Vec<LossKind> {
        let mut kinds = Vec::with_capacity(3);
        if self.flags.ce_ssc {
            kinds.push(LossKind::CrossEntropy);
        }
        if self.flags.sem_scal {
            kinds.push(LossKind::SemanticScalar);
        }
        if self.flags.geo_scal {
            kinds.push(LossKind::GeometricScalar);
        }
        kinds
    }

    /// Compute every enabled loss term.
    pub fn training_step(&self, ssc_logit: &ClassVolume, target: &LabelVolume) -> SscResult<LossMap> {
        let inputs = LossInputs {
            prediction: ssc_logit,
            target,
            class_weights: &self.class_weights,
            alpha: None,
        };
        let mut losses = LossMap::new();
        for kind in self.enabled() {
            let term = self.terms.get(&kind).ok_or_else(|| {
                SscError::Config(format!("loss {kind} enabled but no loss term registered"))
            })?;
            let value = term.compute(&inputs)?;
            if !value.is_finite() {
                log::warn!("{kind} is non-finite: {value}");
            }
            losses.insert(kind.key(), value);
        }
        log::debug!("training step: {} loss terms", losses.len());
        Ok(losses)
    }

    /// Argmax prediction, persisted when a sink is configured.
    pub fn validation_step(
        &self,
        ssc_logit: &ClassVolume,
        target: &LabelVolume,
        frame: &FrameKey,
    ) -> SscResult<EvalPayload> {
        if ssc_logit.shape != target.shape {
            return Err(SscError::Contract(format!(
                "prediction grid {} does not match target grid {}",
                ssc_logit.shape, target.shape
            )));
        }
        let y_pred = ssc_logit.argmax();
        if let Some(sink) = &self.sink {
            sink.persist(frame, ssc_logit, &y_pred)?;
        }
        Ok(EvalPayload {
            y_pred,
            y_true: target.clone(),
        })
    }

    pub fn step(
        &self,
        mode: StepMode,
        ssc_logit: &ClassVolume,
        target: &LabelVolume,
        frame: &FrameKey,
    ) -> SscResult<StepOutput> {
        match mode {
            StepMode::Train => self.training_step(ssc_logit, target).map(StepOutput::Losses),
            StepMode::Eval => self
                .validation_step(ssc_logit, target, frame)
                .map(StepOutput::Predictions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::ExternalLoss;
    use crate::persistence::NpyLogitStore;
    use ssc_types::{GridShape, IGNORE_LABEL};

    const SHAPE: GridShape = GridShape::new(1, 1, 2);

    fn config(flags: LossFlags) -> SscConfig {
        SscConfig {
            n_classes: 2,
            class_weights: vec![1.0, 1.0],
            losses: flags,
            ..SscConfig::default()
        }
    }

    fn logits() -> ClassVolume {
        ClassVolume::new(2, SHAPE, vec![0.0, 2.0, 1.0, 0.0]).unwrap()
    }

    fn target() -> LabelVolume {
        LabelVolume::new(SHAPE, vec![1, IGNORE_LABEL]).unwrap()
    }

    fn constant(v: f64) -> Arc<dyn LossTerm> {
        Arc::new(ExternalLoss::new(move |_| Ok(v)))
    }

    #[test]
    fn test_train_assembles_enabled_terms() {
        let d = StepDispatcher::new(&config(LossFlags::default()))
            .with_loss(LossKind::SemanticScalar, constant(0.25))
            .with_loss(LossKind::GeometricScalar, constant(0.75));
        let losses = d.training_step(&logits(), &target()).unwrap();
        assert_eq!(
            losses.keys().copied().collect::<Vec<_>>(),
            vec!["loss_geo_scal", "loss_sem_scal", "loss_ssc"]
        );
        assert_eq!(losses["loss_sem_scal"], 0.25);
        assert_eq!(losses["loss_geo_scal"], 0.75);
        // voxel 0: label 1 with logits (0, 1)
        let expected = (1.0f64.exp() + 1.0).ln() - 1.0;
        assert!((losses["loss_ssc"] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_train_subset() {
        let flags = LossFlags {
            ce_ssc: false,
            sem_scal: true,
            geo_scal: false,
        };
        let d = StepDispatcher::new(&config(flags)).with_loss(LossKind::SemanticScalar, constant(1.0));
        let losses = d.training_step(&logits(), &target()).unwrap();
        assert_eq!(losses.len(), 1);
        assert!(losses.contains_key("loss_sem_scal"));
    }

    #[test]
    fn test_enabled_term_without_collaborator() {
        let d = StepDispatcher::new(&config(LossFlags::default()));
        assert!(matches!(
            d.training_step(&logits(), &target()),
            Err(SscError::Config(_))
        ));
    }

    #[test]
    fn test_eval_returns_argmax_and_target() {
        let d = StepDispatcher::new(&config(LossFlags::default()));
        let payload = d
            .validation_step(&logits(), &target(), &FrameKey::new("00", "1"))
            .unwrap();
        assert_eq!(payload.y_pred.data, vec![1, 0]);
        assert_eq!(payload.y_true, target());
    }

    #[test]
    fn test_eval_persists_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(NpyLogitStore::new(dir.path()));
        let d = StepDispatcher::new(&config(LossFlags::default())).with_sink(store.clone());
        let key = FrameKey::new("04", "9");
        let out = d.step(StepMode::Eval, &logits(), &target(), &key).unwrap();
        assert!(matches!(out, StepOutput::Predictions(_)));
        assert_eq!(store.load(&key).unwrap(), Some(logits()));
    }

    #[test]
    fn test_step_train_mode() {
        let flags = LossFlags {
            ce_ssc: true,
            sem_scal: false,
            geo_scal: false,
        };
        let d = StepDispatcher::new(&config(flags));
        match d
            .step(StepMode::Train, &logits(), &target(), &FrameKey::new("00", "0"))
            .unwrap()
        {
            StepOutput::Losses(l) => assert!(l.contains_key("loss_ssc")),
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_eval_shape_mismatch() {
        let d = StepDispatcher::new(&config(LossFlags::default()));
        let t = LabelVolume::filled(GridShape::new(2, 1, 1), 0);
        assert!(d
            .validation_step(&logits(), &t, &FrameKey::new("00", "0"))
            .is_err());
    }
}
