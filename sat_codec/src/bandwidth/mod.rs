//! Target bandwidth handling.
//!
//! This module contains:
//! - `BandwidthSpec`: the ordered list of supported bitrates (kbps)
//! - `stages_for_bandwidth`: bitrate → active stage count
//! - `BandwidthSelector`: per-batch random choice agreed across workers
//! - `broadcast`: the collective used to agree on that choice
//! - `rng`: seeded random source for reproducible draws

pub mod broadcast;
pub mod rng;

use rand::Rng;

use crate::bandwidth::broadcast::Broadcast;
use crate::error::{CodecError, Result};

/// Worker that draws the training bandwidth for everyone.
pub const ROOT_RANK: usize = 0;

/// Map a bandwidth in kbps to a number of quantizer stages.
///
/// `floor(bandwidth · 1000 / (frame_rate · bits_per_stage))`, clamped to `[1, max_stages]`.
pub fn stages_for_bandwidth(
    bandwidth_kbps: f64,
    frame_rate: usize,
    bits_per_stage: u32,
    max_stages: usize,
) -> usize {
    let bits_per_frame = (frame_rate as f64) * (bits_per_stage as f64);
    let stages = if bits_per_frame > 0.0 {
        (bandwidth_kbps * 1000.0 / bits_per_frame).floor()
    } else {
        0.0
    };
    // float -> usize casts saturate, NaN maps to 0
    (stages as usize).clamp(1, max_stages.max(1))
}

/// Ordered list of supported target bandwidths in kbps.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthSpec {
    bandwidths: Vec<f64>,
}

impl BandwidthSpec {
    pub fn new(bandwidths: Vec<f64>) -> Result<Self> {
        if bandwidths.is_empty() {
            return Err(CodecError::Config(
                "at least one target bandwidth is required".to_string(),
            ));
        }
        Ok(Self { bandwidths })
    }

    pub fn bandwidths(&self) -> &[f64] {
        &self.bandwidths
    }

    pub fn len(&self) -> usize {
        self.bandwidths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bandwidths.is_empty()
    }

    /// Position of `bandwidth` in the list, if supported.
    pub fn position(&self, bandwidth: f64) -> Option<usize> {
        self.bandwidths
            .iter()
            .position(|bw| (bw - bandwidth).abs() <= 1e-9)
    }

    /// Accept `bandwidth` only if it is one of the configured values.
    pub fn validate(&self, bandwidth: f64) -> Result<f64> {
        match self.position(bandwidth) {
            Some(idx) => Ok(self.bandwidths[idx]),
            None => Err(CodecError::UnsupportedBandwidth {
                requested: bandwidth,
                supported: self.bandwidths.clone(),
            }),
        }
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.bandwidths.get(index).copied()
    }
}

/// Picks one bandwidth per training batch, identical on every worker.
#[derive(Debug, Clone)]
pub struct BandwidthSelector {
    spec: BandwidthSpec,
}

impl BandwidthSelector {
    pub fn new(spec: BandwidthSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &BandwidthSpec {
        &self.spec
    }

    /// Draw a bandwidth on the root worker and broadcast it.
    ///
    /// Every worker of the group must call this once per batch; the call
    /// blocks until all of them have arrived.
    pub fn select_for_batch<R, B>(&self, rng: &mut R, group: &B) -> Result<f64>
    where
        R: Rng + ?Sized,
        B: Broadcast + ?Sized,
    {
        let local = if group.rank() == ROOT_RANK {
            rng.gen_range(0..self.spec.len())
        } else {
            0
        };
        let index = group.broadcast(local, ROOT_RANK)?;
        let bandwidth = self.spec.get(index).ok_or_else(|| {
            CodecError::Broadcast(format!(
                "received bandwidth index {index}, only {} bandwidths configured",
                self.spec.len()
            ))
        })?;
        tracing::debug!(rank = group.rank(), bandwidth, "Selected training bandwidth");
        Ok(bandwidth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::broadcast::{LocalBroadcast, thread_group};
    use crate::bandwidth::rng::seeded_rng;

    #[test]
    fn test_stage_count_for_reference_configuration() {
        // 24 kHz, hop 320 -> 75 Hz, 1024 bins -> 10 bits per stage
        assert_eq!(stages_for_bandwidth(3.0, 75, 10, 5), 4);
        assert_eq!(stages_for_bandwidth(1.5, 75, 10, 5), 2);
        assert_eq!(stages_for_bandwidth(24.0, 75, 10, 5), 5); // clamped to K
        assert_eq!(stages_for_bandwidth(0.1, 75, 10, 5), 1); // clamped to 1
    }

    #[test]
    fn test_stage_count_is_deterministic_and_bounded() {
        let spec = BandwidthSpec::new(vec![1.5, 3.0, 6.0, 12.0, 24.0]).unwrap();
        for &bw in spec.bandwidths() {
            let first = stages_for_bandwidth(bw, 75, 10, 8);
            assert_eq!(first, stages_for_bandwidth(bw, 75, 10, 8));
            assert!((1..=8).contains(&first));
        }
    }

    #[test]
    fn test_unsupported_bandwidth_rejected() {
        let spec = BandwidthSpec::new(vec![3.0, 6.0, 12.0, 24.0]).unwrap();
        match spec.validate(5.0) {
            Err(CodecError::UnsupportedBandwidth {
                requested,
                supported,
            }) => {
                assert_eq!(requested, 5.0);
                assert_eq!(supported, vec![3.0, 6.0, 12.0, 24.0]);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(spec.validate(6.0).unwrap(), 6.0);
    }

    #[test]
    fn test_single_worker_selection_is_reproducible() {
        let selector = BandwidthSelector::new(BandwidthSpec::new(vec![3.0, 6.0, 12.0]).unwrap());

        let draws = |seed| {
            let mut rng = seeded_rng(seed);
            (0..16)
                .map(|_| selector.select_for_batch(&mut rng, &LocalBroadcast).unwrap())
                .collect::<Vec<_>>()
        };

        let first = draws(7);
        assert_eq!(first, draws(7));
        assert!(first.iter().all(|bw| [3.0, 6.0, 12.0].contains(bw)));
    }

    #[test]
    fn test_workers_agree_on_bandwidth() {
        let selector = BandwidthSelector::new(BandwidthSpec::new(vec![1.5, 3.0, 6.0, 12.0]).unwrap());
        let members = thread_group(4);

        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                let selector = selector.clone();
                std::thread::spawn(move || {
                    // every worker has its own, differently seeded generator
                    let mut rng = seeded_rng(100 + member.rank() as u64);
                    (0..8)
                        .map(|_| selector.select_for_batch(&mut rng, &member).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<f64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
    }
}
