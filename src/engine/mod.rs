//! Recognition Engine Layer
//!
//! The recognition engine is an opaque capability: it is constructed for a
//! language/orientation configuration and asked to `predict` text regions
//! in an image under a round's typed [`RoundParams`].
//! Construction is expensive, so handles live in an [`EngineInstancePool`].

pub mod command;
pub mod pool;

use image::DynamicImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::EngineError;

pub use command::CommandEngineFactory;
pub use pool::{EngineInstancePool, DEFAULT_POOL_CAPACITY};

/// Identity of a pooled engine handle.
///
/// Geometry and threshold parameters are not part of the key; they are
/// applied per round onto a shared handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineInstanceKey {
    /// Engine language code (e.g. "ch", "japan", "en")
    pub language: String,
    /// Whether the text-orientation classifier is loaded
    pub use_angle_cls: bool,
    /// Whether the document unwarping model is loaded
    pub use_unwarp: bool,
}

impl EngineInstanceKey {
    /// Create a new key
    pub fn new(language: impl Into<String>, use_angle_cls: bool, use_unwarp: bool) -> Self {
        Self {
            language: language.into(),
            use_angle_cls,
            use_unwarp,
        }
    }
}

impl fmt::Display for EngineInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(cls={}, unwarp={})",
            self.language, self.use_angle_cls, self.use_unwarp
        )
    }
}

/// How the pre-scaling side limit is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Limit applies to the longer side
    #[default]
    Max,
    /// Limit applies to the shorter side
    Min,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Max => "max",
            LimitType::Min => "min",
        }
    }
}

/// Per-round detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundParams {
    /// Which side the scale limit applies to
    pub limit_type: LimitType,
    /// Side length limit in pixels
    pub limit_side_len: u32,
    /// Pixel-level text probability threshold
    pub det_thresh: f32,
    /// Box-level score threshold
    pub box_thresh: f32,
    /// Expansion ratio applied to detected text shapes
    pub unclip_ratio: f32,
    /// Minimum recognition score for a text to be kept
    pub rec_score_thresh: f32,
    /// Run the orientation classifier
    pub use_angle_cls: bool,
    /// Run the unwarping model
    pub use_unwarp: bool,
}

impl RoundParams {
    /// The pool key this round needs for the given language
    pub fn engine_key(&self, language: &str) -> EngineInstanceKey {
        EngineInstanceKey::new(language, self.use_angle_cls, self.use_unwarp)
    }
}

impl Default for RoundParams {
    fn default() -> Self {
        Self {
            limit_type: LimitType::Max,
            limit_side_len: 960,
            det_thresh: 0.3,
            box_thresh: 0.6,
            unclip_ratio: 1.5,
            rec_score_thresh: 0.5,
            use_angle_cls: false,
            use_unwarp: false,
        }
    }
}

/// A single text detection returned by `predict`
#[derive(Debug, Clone, PartialEq)]
pub struct TextDetection {
    /// Bounding polygon points
    pub polygon: Vec<(f32, f32)>,
    /// Recognized text
    pub text: String,
    /// Recognition score (0.0 - 1.0)
    pub score: f32,
}

impl TextDetection {
    /// Axis-aligned bounding box (x, y, width, height)
    pub fn bounds(&self) -> (u32, u32, u32, u32) {
        polygon_to_bounds(&self.polygon)
    }
}

/// A constructed recognition engine.
///
/// Round parameters are passed with every call, so one handle can serve
/// several workers at once. Engines that keep per-round state implement
/// [`StatefulEngine`] instead and are wrapped in [`Exclusive`].
pub trait RecognitionEngine: Send + Sync {
    /// Reject round parameters this handle cannot honour
    fn configure(&self, _params: &RoundParams) -> Result<(), EngineError> {
        Ok(())
    }

    /// Run detection and recognition on an image
    fn predict(
        &self,
        params: &RoundParams,
        image: &DynamicImage,
    ) -> Result<Vec<TextDetection>, EngineError>;
}

/// An engine that must be reconfigured in place before each prediction
pub trait StatefulEngine: Send {
    fn configure(&mut self, params: &RoundParams) -> Result<(), EngineError>;

    fn predict(&mut self, image: &DynamicImage) -> Result<Vec<TextDetection>, EngineError>;
}

/// Serializes a [`StatefulEngine`] so `configure` and `predict` run as one
/// critical section
pub struct Exclusive<E> {
    inner: Mutex<E>,
}

impl<E: StatefulEngine> Exclusive<E> {
    pub fn new(engine: E) -> Self {
        Self {
            inner: Mutex::new(engine),
        }
    }
}

impl<E: StatefulEngine> RecognitionEngine for Exclusive<E> {
    fn predict(
        &self,
        params: &RoundParams,
        image: &DynamicImage,
    ) -> Result<Vec<TextDetection>, EngineError> {
        let mut engine = self.inner.lock();
        engine.configure(params).map_err(as_configuration)?;
        engine.predict(image)
    }
}

/// Builds engines for pool keys
pub trait EngineFactory: Send + Sync {
    /// Construct a new engine (expensive, may take seconds)
    fn construct(&self, key: &EngineInstanceKey) -> Result<Box<dyn RecognitionEngine>, EngineError>;
}

/// Shared handle to a pooled engine
pub struct EngineHandle {
    key: EngineInstanceKey,
    engine: Box<dyn RecognitionEngine>,
}

impl EngineHandle {
    /// Wrap a constructed engine
    pub fn new(key: EngineInstanceKey, engine: Box<dyn RecognitionEngine>) -> Self {
        Self { key, engine }
    }

    /// Key this handle was built for
    pub fn key(&self) -> &EngineInstanceKey {
        &self.key
    }

    /// Configure the engine for a round and run it on an image.
    ///
    /// Configuration failures surface as [`EngineError::Configuration`].
    pub fn run(
        &self,
        params: &RoundParams,
        image: &DynamicImage,
    ) -> Result<Vec<TextDetection>, EngineError> {
        self.engine.configure(params).map_err(as_configuration)?;
        self.engine.predict(params, image)
    }
}

fn as_configuration(error: EngineError) -> EngineError {
    match error {
        EngineError::Configuration(msg) => EngineError::Configuration(msg),
        other => EngineError::Configuration(other.to_string()),
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").field("key", &self.key).finish()
    }
}

/// Convert polygon points to bounding box
fn polygon_to_bounds(polygon: &[(f32, f32)]) -> (u32, u32, u32, u32) {
    if polygon.is_empty() {
        return (0, 0, 0, 0);
    }

    let min_x = polygon.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let min_y = polygon.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_x = polygon.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let max_y = polygon.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);

    (
        min_x.max(0.0) as u32,
        min_y.max(0.0) as u32,
        (max_x - min_x) as u32,
        (max_y - min_y) as u32,
    )
}

/// Call-counting engine double shared by the tests of every layer
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Script = dyn Fn(&RoundParams, &DynamicImage) -> Result<Vec<TextDetection>, EngineError>
        + Send
        + Sync;

    /// Counters observed by tests
    #[derive(Debug, Default)]
    pub struct Calls {
        pub constructed: AtomicUsize,
        pub predicted: AtomicUsize,
    }

    impl Calls {
        pub fn constructed(&self) -> usize {
            self.constructed.load(Ordering::SeqCst)
        }

        pub fn predicted(&self) -> usize {
            self.predicted.load(Ordering::SeqCst)
        }
    }

    /// Factory producing scripted engines
    pub struct FakeFactory {
        pub calls: Arc<Calls>,
        script: Arc<Script>,
        failing_keys: HashSet<EngineInstanceKey>,
        fail_all: bool,
    }

    impl FakeFactory {
        pub fn new<F>(script: F) -> Self
        where
            F: Fn(&RoundParams, &DynamicImage) -> Result<Vec<TextDetection>, EngineError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                calls: Arc::new(Calls::default()),
                script: Arc::new(script),
                failing_keys: HashSet::new(),
                fail_all: false,
            }
        }

        /// Engine that always returns the given detections
        pub fn returning(detections: Vec<TextDetection>) -> Self {
            Self::new(move |_, _| Ok(detections.clone()))
        }

        pub fn failing_on(mut self, key: EngineInstanceKey) -> Self {
            self.failing_keys.insert(key);
            self
        }

        pub fn failing_always(mut self) -> Self {
            self.fail_all = true;
            self
        }
    }

    impl EngineFactory for FakeFactory {
        fn construct(
            &self,
            key: &EngineInstanceKey,
        ) -> Result<Box<dyn RecognitionEngine>, EngineError> {
            if self.fail_all || self.failing_keys.contains(key) {
                return Err(EngineError::Construction(format!("no model for {key}")));
            }
            self.calls.constructed.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeEngine {
                calls: self.calls.clone(),
                script: self.script.clone(),
            }))
        }
    }

    struct FakeEngine {
        calls: Arc<Calls>,
        script: Arc<Script>,
    }

    impl RecognitionEngine for FakeEngine {
        fn predict(
            &self,
            params: &RoundParams,
            image: &DynamicImage,
        ) -> Result<Vec<TextDetection>, EngineError> {
            self.calls.predicted.fetch_add(1, Ordering::SeqCst);
            (self.script)(params, image)
        }
    }

    /// Shorthand for a detection with a unit-square polygon
    pub fn detection(text: &str, score: f32) -> TextDetection {
        TextDetection {
            polygon: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
            text: text.to_string(),
            score,
        }
    }
}
