//! Session progress estimation
//!
//! Progress is a single 0..100 integer derived from a weighted phase
//! machine. Weights are expressed in units of one standard message
//! send/receive roundtrip and adapt while the sync runs: extra roundtrips
//! and large item counts stretch the remaining phases instead of letting
//! the number run over 100.

use serde::{Deserialize, Serialize};

use crate::status::SyncMode;

/// Phases of one sync session, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum ProgressStep {
	/// no sync in progress
	Invalid = 0,
	/// local preparation (change detection)
	Prepare = 1,
	/// connection setup and the first exchange
	Init = 2,
	/// sending our changes
	Data = 3,
	/// receiving peer changes and wrapping up
	Uninit = 4,
}

const STEP_TOTAL: usize = 5;

/// ratio of the preparation step to a standard roundtrip
const PREPARE_RATIO: f64 = 0.2;
/// first data access is the expensive one
const DATA_PREPARE_RATIO: f64 = 0.10;
const ONEITEM_SEND_RATIO: f64 = 0.05;
const ONEITEM_RECEIVE_RATIO: f64 = 0.05;
const CONN_SETUP_RATIO: f64 = 0.5;
/// assumed item count per direction before real numbers are known
const DEFAULT_ITEMS: f64 = 5.0;
/// assumed message roundtrips per step
const MSG_SEND_RECEIVE_TIMES: f64 = 1.0;

const INTERNAL_TWO_WAY: u8 = 1;
const INTERNAL_ONLY_TO_PEER: u8 = 2;
const INTERNAL_ONLY_FROM_PEER: u8 = 4;

fn default_units(step: usize) -> f64 {
	match step {
		1 => PREPARE_RATIO,
		2 => CONN_SETUP_RATIO + MSG_SEND_RECEIVE_TIMES,
		3 => ONEITEM_SEND_RATIO * DEFAULT_ITEMS + DATA_PREPARE_RATIO + MSG_SEND_RECEIVE_TIMES,
		4 => ONEITEM_RECEIVE_RATIO * DEFAULT_ITEMS + DATA_PREPARE_RATIO + MSG_SEND_RECEIVE_TIMES,
		_ => 0.0,
	}
}

/// Weighted phase machine producing the session progress percentage
#[derive(Debug)]
pub struct ProgressData {
	progress: f64,
	step: ProgressStep,
	send_counts: u32,
	internal_mode: u8,
	/// proportion of the total when each step ends
	sync_prop: [f64; STEP_TOTAL],
	/// remaining units of each step
	sync_units: [f64; STEP_TOTAL],
	/// share of one unit in the total, changes dynamically
	prop_of_unit: f64,
	/// source currently receiving items
	source: String,
}

impl ProgressData {
	pub fn new() -> Self {
		let mut sync_units = [0.0; STEP_TOTAL];
		let mut total_units = 0.0;
		for (step, units) in sync_units.iter_mut().enumerate() {
			*units = default_units(step);
			total_units += *units;
		}

		let mut sync_prop = [0.0; STEP_TOTAL];
		for i in 1..STEP_TOTAL - 1 {
			sync_prop[i] = sync_prop[i - 1] + sync_units[i] / total_units;
		}
		sync_prop[STEP_TOTAL - 1] = 1.0;

		ProgressData {
			progress: 0.0,
			step: ProgressStep::Invalid,
			send_counts: 0,
			internal_mode: 0,
			sync_prop,
			sync_units,
			prop_of_unit: 1.0 / total_units,
			source: String::new(),
		}
	}

	/// Current progress percentage
	pub fn percent(&self) -> i32 {
		(self.progress.clamp(0.0, 100.0)) as i32
	}

	pub fn step(&self) -> ProgressStep {
		self.step
	}

	/// Enter a new phase; progress jumps to the end of the previous one
	pub fn set_step(&mut self, step: ProgressStep) {
		if self.step != step {
			self.progress = 100.0 * self.sync_prop[self.step as usize];
			self.step = step;
			self.send_counts = 0;
			self.source.clear();
		}
	}

	/// Narrow the weights for the modes taking part in this sync
	pub fn add_sync_mode(&mut self, mode: SyncMode) {
		if mode.to_peer_only() {
			self.internal_mode |= INTERNAL_ONLY_TO_PEER;
		} else if mode.from_peer_only() {
			self.internal_mode |= INTERNAL_ONLY_FROM_PEER;
		} else if mode.is_enabled() {
			self.internal_mode |= INTERNAL_TWO_WAY;
		}
	}

	/// A message is about to be sent
	pub fn send_start(&mut self) {
		self.check_internal_mode();
		self.send_counts += 1;

		// more roundtrips than the default estimate: stretch this step
		if f64::from(self.send_counts) > MSG_SEND_RECEIVE_TIMES {
			self.sync_units[self.step as usize] += 1.0;
			self.recalc();
		}
		// sending during uninit usually includes item handling time
		if self.step == ProgressStep::Uninit
			&& (self.sync_units[self.step as usize] - MSG_SEND_RECEIVE_TIMES).abs() > f64::EPSILON
		{
			self.update_prog(DATA_PREPARE_RATIO);
		}
	}

	/// A reply has been fully received
	pub fn receive_end(&mut self) {
		self.update_prog(self.sync_units[self.step as usize]);
	}

	/// First data access of an outgoing item batch
	pub fn item_prepare(&mut self) {
		self.check_internal_mode();
		// only the first prepare of a batch costs real time
		if self.source.is_empty() {
			self.source = "prepare".to_string();
			self.update_prog(DATA_PREPARE_RATIO);
		}
	}

	/// An incoming item has been processed for `source`
	pub fn item_receive(&mut self, source: &str, _count: i32, total: i32) {
		if self.source.is_empty() {
			self.source = source.to_string();
			if total != 0 {
				self.sync_units[ProgressStep::Uninit as usize] +=
					ONEITEM_RECEIVE_RATIO * (f64::from(total) - DEFAULT_ITEMS);
				self.recalc();
			}
		} else if self.source != source {
			self.source = source.to_string();
			if total != 0 {
				self.sync_units[ProgressStep::Uninit as usize] +=
					ONEITEM_RECEIVE_RATIO * f64::from(total);
				self.recalc();
			}
		}
		self.update_prog(ONEITEM_RECEIVE_RATIO);
	}

	fn update_prog(&mut self, ratio: f64) {
		self.progress += self.prop_of_unit * 100.0 * ratio;
		self.sync_units[self.step as usize] -= ratio;
	}

	/// Re-derive unit proportions from what remains
	fn recalc(&mut self) {
		let units = self.remaining_units();
		if units.abs() < f64::EPSILON {
			self.prop_of_unit = 0.0;
		} else {
			self.prop_of_unit = (100.0 - self.progress) / (100.0 * units);
		}
		let step = self.step as usize;
		if step != STEP_TOTAL - 1 {
			self.sync_prop[step] =
				self.progress / 100.0 + self.sync_units[step] * self.prop_of_unit;
			for i in step + 1..STEP_TOTAL - 1 {
				self.sync_prop[i] = self.sync_prop[i - 1] + self.sync_units[i] * self.prop_of_unit;
			}
		}
	}

	fn check_internal_mode(&mut self) {
		if self.internal_mode == 0 || self.internal_mode & INTERNAL_TWO_WAY != 0 {
			self.internal_mode = 0;
			return;
		}
		if self.internal_mode & INTERNAL_ONLY_TO_PEER != 0 {
			// nothing comes back: drop the receive units
			self.sync_units[ProgressStep::Uninit as usize] -=
				ONEITEM_RECEIVE_RATIO * DEFAULT_ITEMS + DATA_PREPARE_RATIO;
			self.recalc();
		} else if self.internal_mode & INTERNAL_ONLY_FROM_PEER != 0 {
			// nothing to send: drop the send units
			self.sync_units[ProgressStep::Data as usize] -=
				ONEITEM_SEND_RATIO * DEFAULT_ITEMS + DATA_PREPARE_RATIO;
			self.recalc();
		}
		self.internal_mode = 0;
	}

	fn remaining_units(&self) -> f64 {
		(self.step as usize..STEP_TOTAL).map(|i| self.sync_units[i]).sum()
	}
}

impl Default for ProgressData {
	fn default() -> Self {
		Self::new()
	}
}

/// Progress of one source, reported alongside the session percentage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceProgress {
	/// "", "preparing", "sending" or "receiving"
	pub phase: String,
	pub prepare_count: i32,
	pub prepare_total: i32,
	pub send_count: i32,
	pub send_total: i32,
	pub receive_count: i32,
	pub receive_total: i32,
}

impl SourceProgress {
	pub fn preparing(&mut self, count: i32, total: i32) {
		self.phase = "preparing".to_string();
		self.prepare_count = count;
		self.prepare_total = total;
	}

	pub fn sending(&mut self, count: i32, total: i32) {
		self.phase = "sending".to_string();
		self.send_count = count;
		self.send_total = total;
	}

	pub fn receiving(&mut self, count: i32, total: i32) {
		self.phase = "receiving".to_string();
		self.receive_count = count;
		self.receive_total = total;
	}

	pub fn idle(&mut self) {
		self.phase.clear();
	}
}


// vim: ts=4
