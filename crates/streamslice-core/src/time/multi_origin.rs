//! Minimum watermark across several origins.

use fxhash::FxHashMap;
use rkyv::{
    rancor::Error as RkyvError, Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize,
};

use super::{OriginId, SequenceData, Watermark, WatermarkConfig, WatermarkError, WatermarkProcessor};

/// Watermark state of one origin, as captured by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct OriginWatermark {
    /// The origin.
    pub origin: OriginId,
    /// Its watermark at snapshot time.
    pub watermark: Watermark,
    /// The next sequence number it was waiting for.
    pub next_sequence: u64,
}

/// Exported state of a [`MultiOriginWatermarkProcessor`].
///
/// Only the applied prefix of each origin is captured; updates still waiting
/// in a log for an earlier sequence number are not. Take snapshots while the
/// operator is quiescent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct WatermarkSnapshot {
    /// Per-origin state, in registration order.
    pub origins: Vec<OriginWatermark>,
}

impl WatermarkSnapshot {
    /// Encodes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Snapshot`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WatermarkError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| WatermarkError::Snapshot(e.to_string()))
    }

    /// Decodes a snapshot produced by [`WatermarkSnapshot::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::Snapshot`] if the bytes are not a valid snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WatermarkError> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::access::<rkyv::Archived<WatermarkSnapshot>, RkyvError>(&aligned)
            .map_err(|e| WatermarkError::Snapshot(e.to_string()))?;
        rkyv::deserialize::<WatermarkSnapshot, RkyvError>(archived)
            .map_err(|e| WatermarkError::Snapshot(e.to_string()))
    }
}

/// Reduces the watermarks of several origins to their minimum.
///
/// Each origin gets its own [`WatermarkProcessor`]; the global watermark is
/// the smallest of them, so a window only becomes eligible once every origin
/// has moved past its end.
///
/// # Example
///
/// ```rust
/// use streamslice_core::time::{
///     MultiOriginWatermarkProcessor, OriginId, SequenceData, Watermark, WatermarkConfig,
/// };
///
/// let processor = MultiOriginWatermarkProcessor::new(
///     [OriginId(1), OriginId(2)],
///     WatermarkConfig::default(),
/// );
/// processor.update(OriginId(1), Watermark::new(500), SequenceData::new(0))?;
/// assert_eq!(processor.current_watermark(), Watermark::MIN);
///
/// processor.update(OriginId(2), Watermark::new(300), SequenceData::new(0))?;
/// assert_eq!(processor.current_watermark(), Watermark::new(300));
/// # Ok::<(), streamslice_core::time::WatermarkError>(())
/// ```
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    processors: Vec<WatermarkProcessor>,
    index: FxHashMap<OriginId, usize>,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor tracking `origins`.
    ///
    /// Duplicate origins are registered once.
    #[must_use]
    pub fn new(origins: impl IntoIterator<Item = OriginId>, config: WatermarkConfig) -> Self {
        let mut processors = Vec::new();
        let mut index = FxHashMap::default();
        for origin in origins {
            index.entry(origin).or_insert_with(|| {
                processors.push(WatermarkProcessor::for_origin(origin, config));
                processors.len() - 1
            });
        }
        Self { processors, index }
    }

    /// Recreates a processor from a snapshot.
    #[must_use]
    pub fn restore(snapshot: &WatermarkSnapshot, config: WatermarkConfig) -> Self {
        let mut processors = Vec::with_capacity(snapshot.origins.len());
        let mut index = FxHashMap::default();
        for state in &snapshot.origins {
            index.entry(state.origin).or_insert_with(|| {
                processors.push(WatermarkProcessor::restored(
                    state.origin,
                    config,
                    state.watermark,
                    state.next_sequence,
                ));
                processors.len() - 1
            });
        }
        Self { processors, index }
    }

    /// Applies an update for `origin` and returns the global watermark.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] for an unregistered origin and
    /// propagates the per-origin errors of [`WatermarkProcessor::update`].
    pub fn update(
        &self,
        origin: OriginId,
        watermark: Watermark,
        sequence: SequenceData,
    ) -> Result<Watermark, WatermarkError> {
        self.processor(origin)?.update(watermark, sequence)?;
        Ok(self.current_watermark())
    }

    /// Returns the minimum watermark over all origins.
    ///
    /// With no registered origins nothing can hold time back and the result
    /// is [`Watermark::MAX`].
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        self.processors
            .iter()
            .map(WatermarkProcessor::current_watermark)
            .min()
            .unwrap_or(Watermark::MAX)
    }

    /// Returns the watermark of one origin.
    ///
    /// # Errors
    ///
    /// Returns [`WatermarkError::UnknownOrigin`] for an unregistered origin.
    pub fn origin_watermark(&self, origin: OriginId) -> Result<Watermark, WatermarkError> {
        Ok(self.processor(origin)?.current_watermark())
    }

    /// Returns the watermark of every origin, in registration order.
    #[must_use]
    pub fn origin_watermarks(&self) -> Vec<(OriginId, Watermark)> {
        self.processors
            .iter()
            .map(|p| (p.origin(), p.current_watermark()))
            .collect()
    }

    /// Returns the registered origins.
    pub fn origins(&self) -> impl Iterator<Item = OriginId> + '_ {
        self.processors.iter().map(WatermarkProcessor::origin)
    }

    /// Exports the applied state of every origin.
    #[must_use]
    pub fn snapshot(&self) -> WatermarkSnapshot {
        WatermarkSnapshot {
            origins: self
                .processors
                .iter()
                .map(|p| OriginWatermark {
                    origin: p.origin(),
                    watermark: p.current_watermark(),
                    next_sequence: p.next_sequence(),
                })
                .collect(),
        }
    }

    fn processor(&self, origin: OriginId) -> Result<&WatermarkProcessor, WatermarkError> {
        self.index
            .get(&origin)
            .map(|&i| &self.processors[i])
            .ok_or(WatermarkError::UnknownOrigin(origin))
    }
}
