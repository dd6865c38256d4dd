//! The decimator: an independent consumer of the FA buffer producing a
//! second, lower-rate live buffer for subscription (spec.md section 4.5's
//! sibling, described in section 2 item 5). The CIC/FIR coefficients
//! themselves are a black box per spec.md section 1 ("the CIC/FIR
//! decimation DSP coefficients (treated as a black-box filter)"); only
//! the pipeline shape and the `name=value` config grammar (spec.md
//! section 6) are specified.

use std::collections::VecDeque;

use serde_derive::{Deserialize, Serialize};

use block::FaBlock;
use buffer::{ReadOutcome, ReaderId, RingBuffer};
use error::{Error, Result};
use raw::Frame;
use sync::ShutdownHandle;

/// Typed result of parsing a decimator configuration file (spec.md
/// section 6, "Configuration file (decimator only)").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecimationConfig {
    pub decimation_factor: u32,
    pub history_length: Vec<u32>,
    pub compensation_filter: Vec<f64>,
    pub filter_decimation: Option<u32>,
    pub output_sample_count: usize,
    pub output_block_count: usize,
}

impl DecimationConfig {
    /// Parses the `name=value` grammar; `key[]=value` lines append to a
    /// list-valued key in order of appearance.
    pub fn parse(text: &str) -> Result<Self> {
        let mut decimation_factor = None;
        let mut history_length = Vec::new();
        let mut compensation_filter = Vec::new();
        let mut filter_decimation = None;
        let mut output_sample_count = None;
        let mut output_block_count = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim();
            let value = parts.next().ok_or_else(|| Error::DecimatorConfig {
                reason: format!("line {}: missing '=' in {:?}", lineno + 1, raw_line),
            })?.trim();

            let bad = |field: &str| Error::DecimatorConfig {
                reason: format!("line {}: invalid {} value {:?}", lineno + 1, field, value),
            };

            match key.trim_end_matches("[]") {
                "decimation_factor" => {
                    decimation_factor = Some(value.parse().map_err(|_| bad("decimation_factor"))?)
                }
                "history_length" => history_length.push(value.parse().map_err(|_| bad("history_length"))?),
                "compensation_filter" => {
                    compensation_filter.push(value.parse().map_err(|_| bad("compensation_filter"))?)
                }
                "filter_decimation" => {
                    filter_decimation = Some(value.parse().map_err(|_| bad("filter_decimation"))?)
                }
                "output_sample_count" => {
                    output_sample_count = Some(value.parse().map_err(|_| bad("output_sample_count"))?)
                }
                "output_block_count" => {
                    output_block_count = Some(value.parse().map_err(|_| bad("output_block_count"))?)
                }
                other => {
                    return Err(Error::DecimatorConfig {
                        reason: format!("line {}: unknown key {:?}", lineno + 1, other),
                    })
                }
            }
        }

        Ok(DecimationConfig {
            decimation_factor: decimation_factor.ok_or_else(|| Error::DecimatorConfig {
                reason: "missing decimation_factor".into(),
            })?,
            history_length,
            compensation_filter,
            filter_decimation,
            output_sample_count: output_sample_count.ok_or_else(|| Error::DecimatorConfig {
                reason: "missing output_sample_count".into(),
            })?,
            output_block_count: output_block_count.ok_or_else(|| Error::DecimatorConfig {
                reason: "missing output_block_count".into(),
            })?,
        })
    }
}

impl Default for DecimationConfig {
    /// A plausible default pipeline: decimate by 64 with a 7-tap
    /// compensation filter, matching the `first_decimation_log2 = 6`
    /// default archive configuration.
    fn default() -> Self {
        DecimationConfig {
            decimation_factor: 64,
            history_length: vec![7],
            compensation_filter: vec![
                -0.0156, 0.0, 0.2656, 0.5, 0.2656, 0.0, -0.0156,
            ],
            filter_decimation: None,
            output_sample_count: 1024,
            output_block_count: 64,
        }
    }
}

/// Single-stage boxcar integrator: sums `factor` consecutive frames then
/// emits the sum, the "CIC" half of the pipeline.
struct CicStage {
    sum: (i64, i64),
    count: u32,
    factor: u32,
}

impl CicStage {
    fn new(factor: u32) -> Self {
        CicStage {
            sum: (0, 0),
            count: 0,
            factor,
        }
    }

    fn push(&mut self, frame: Frame) -> Option<Frame> {
        self.sum.0 += frame.x as i64;
        self.sum.1 += frame.y as i64;
        self.count += 1;
        if self.count == self.factor {
            let out = Frame::new(
                (self.sum.0 / self.factor as i64) as i32,
                (self.sum.1 / self.factor as i64) as i32,
            );
            self.sum = (0, 0);
            self.count = 0;
            Some(out)
        } else {
            None
        }
    }
}

/// FIR compensation filter: a fixed-length convolution over the CIC
/// stage's output, applied once its history window fills.
struct FirStage {
    coeffs: Vec<f64>,
    history: VecDeque<Frame>,
}

impl FirStage {
    fn new(coeffs: Vec<f64>) -> Self {
        FirStage {
            history: VecDeque::with_capacity(coeffs.len()),
            coeffs,
        }
    }

    fn push(&mut self, frame: Frame) -> Option<Frame> {
        if self.history.len() == self.coeffs.len() {
            self.history.pop_front();
        }
        self.history.push_back(frame);
        if self.history.len() < self.coeffs.len() {
            return None;
        }
        let mut acc_x = 0.0;
        let mut acc_y = 0.0;
        for (c, f) in self.coeffs.iter().zip(self.history.iter()) {
            acc_x += c * f.x as f64;
            acc_y += c * f.y as f64;
        }
        Some(Frame::new(acc_x.round() as i32, acc_y.round() as i32))
    }
}

/// Per-id CIC+FIR pipeline state.
struct Channel {
    cic: CicStage,
    fir: FirStage,
}

/// Runs on the decimator thread: a reserved reader on the FA buffer, a
/// writer on the decimated live buffer (spec.md section 5, thread list
/// item 3).
pub struct Decimator {
    channels: Vec<Channel>,
    fa_ids: Vec<usize>,
    output_row: Vec<Frame>,
    output_block: FaBlock,
    rows_in_block: usize,
    output_sample_count: usize,
}

impl Decimator {
    pub fn new(config: &DecimationConfig, fa_ids: Vec<usize>) -> Self {
        let channels = fa_ids
            .iter()
            .map(|_| Channel {
                cic: CicStage::new(config.decimation_factor),
                fir: FirStage::new(config.compensation_filter.clone()),
            })
            .collect();
        let width = fa_ids.len();
        Decimator {
            channels,
            fa_ids: fa_ids.clone(),
            output_row: vec![Frame::ZERO; width],
            output_block: FaBlock::new(width, config.output_sample_count),
            rows_in_block: 0,
            output_sample_count: config.output_sample_count,
        }
    }

    /// Feeds one FA row through every channel's CIC+FIR pipeline. Returns
    /// a completed output row once the CIC stage decimates and the FIR
    /// stage's history window has filled.
    fn process_row(&mut self, row: &[Frame]) -> Option<Vec<Frame>> {
        let mut have_output = false;
        for (slot, &id) in self.fa_ids.iter().enumerate() {
            if let Some(cic_out) = self.channels[slot].cic.push(row[id]) {
                if let Some(fir_out) = self.channels[slot].fir.push(cic_out) {
                    self.output_row[slot] = fir_out;
                    have_output = true;
                }
            }
        }
        if have_output {
            Some(self.output_row.clone())
        } else {
            None
        }
    }

    /// Drains the FA buffer and writes decimated rows into
    /// `decimated_buffer` until interrupted (spec.md section 5
    /// cancellation: "decimator" stops before the disk writer).
    pub fn run(
        &mut self,
        fa_buffer: &RingBuffer<FaBlock>,
        fa_reader: ReaderId,
        decimated_buffer: &RingBuffer<FaBlock>,
        shutdown: &ShutdownHandle,
    ) {
        loop {
            if shutdown.is_shutting_down() {
                fa_buffer.interrupt(fa_reader);
            }
            let result = fa_buffer.read(fa_reader);
            match result.outcome {
                ReadOutcome::Interrupted => break,
                ReadOutcome::Overrun => unreachable!("reserved readers are never overrun"),
                ReadOutcome::Gap => {
                    fa_buffer.release_read(fa_reader);
                }
                ReadOutcome::Data(block) => {
                    for r in 0..block.rows() {
                        if let Some(output) = self.process_row(block.row(r)) {
                            self.append_output(&output, decimated_buffer);
                        }
                    }
                    fa_buffer.release_read(fa_reader);
                }
            }
        }
    }

    /// Accumulates one decimated row into a plain, ring-buffer-agnostic
    /// staging block, then reserves and commits a single ring-buffer slot
    /// only once `output_sample_count` rows have been assembled.
    fn append_output(&mut self, row: &[Frame], decimated_buffer: &RingBuffer<FaBlock>) {
        self.output_block.row_mut(self.rows_in_block).copy_from_slice(row);
        self.rows_in_block += 1;
        if self.rows_in_block >= self.output_sample_count {
            let mut w = decimated_buffer.reserve_write();
            *w = self.output_block.clone();
            decimated_buffer.commit_write(w, false, 0);
            self.rows_in_block = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_value_config() {
        let text = "\
decimation_factor=64
history_length[]=7
compensation_filter[]=-0.0156
compensation_filter[]=0.0
compensation_filter[]=0.2656
compensation_filter[]=0.5
compensation_filter[]=0.2656
compensation_filter[]=0.0
compensation_filter[]=-0.0156
output_sample_count=1024
output_block_count=64
";
        let cfg = DecimationConfig::parse(text).unwrap();
        assert_eq!(cfg.decimation_factor, 64);
        assert_eq!(cfg.compensation_filter.len(), 7);
        assert_eq!(cfg.output_sample_count, 1024);
    }

    #[test]
    fn rejects_unknown_key() {
        let text = "mystery=1\n";
        assert!(DecimationConfig::parse(text).is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        let text = "history_length[]=7\n";
        assert!(DecimationConfig::parse(text).is_err());
    }

    #[test]
    fn cic_then_fir_emits_after_warmup() {
        let config = DecimationConfig {
            decimation_factor: 2,
            history_length: vec![3],
            compensation_filter: vec![1.0, 1.0, 1.0],
            filter_decimation: None,
            output_sample_count: 4,
            output_block_count: 4,
        };
        let mut decimator = Decimator::new(&config, vec![0]);

        let mut outputs = 0;
        for i in 0..20i32 {
            let row = vec![Frame::new(i, -i)];
            if decimator.process_row(&row).is_some() {
                outputs += 1;
            }
        }
        // CIC halves the rate; FIR needs 3 CIC outputs before emitting.
        assert_eq!(outputs, 10 - 2);
    }
}
