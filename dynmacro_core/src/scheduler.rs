use std::collections::BTreeMap;

use serde::Serialize;

/// When a timer should next fire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeTime {
	/// Fire at this reactor time, in seconds.
	At(f64),
	/// Parked: the timer exists but never fires until it is reprogrammed.
	Never,
}

impl WakeTime {
	/// `now + duration`, or [`WakeTime::Never`] for a zero duration.
	pub fn after(now: f64, duration: f64) -> Self {
		if duration > 0.0 {
			Self::At(now + duration)
		} else {
			Self::Never
		}
	}

	pub fn at(self) -> Option<f64> {
		match self {
			Self::At(time) => Some(time),
			Self::Never => None,
		}
	}
}

/// Identifies a timer registered with a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TimerHandle(pub u64);

/// The host's timer facility.
///
/// Timer callbacks are not stored here: the host reports due handles to
/// [`MacroEngine::fire_timer`](crate::MacroEngine::fire_timer), which runs the
/// macro and returns the next wake time to program.
pub trait Reactor {
	/// Current reactor time in seconds.
	fn monotonic(&self) -> f64;
	fn register_timer(&mut self, waketime: WakeTime) -> TimerHandle;
	fn update_timer(&mut self, handle: TimerHandle, waketime: WakeTime);
	fn unregister_timer(&mut self, handle: TimerHandle);
}

/// A reactor driven by an explicit virtual clock.
#[derive(Debug, Default)]
pub struct ManualReactor {
	now: f64,
	next_id: u64,
	timers: BTreeMap<TimerHandle, WakeTime>,
}

impl ManualReactor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Move the clock. Time never runs backwards.
	pub fn set_time(&mut self, now: f64) {
		if now > self.now {
			self.now = now;
		}
	}

	pub fn waketime(&self, handle: TimerHandle) -> Option<WakeTime> {
		self.timers.get(&handle).copied()
	}

	/// The armed timer with the earliest wake time at or before `until`.
	pub fn next_due(&self, until: f64) -> Option<(TimerHandle, f64)> {
		self.timers
			.iter()
			.filter_map(|(handle, wake)| wake.at().map(|at| (*handle, at)))
			.filter(|(_, at)| *at <= until)
			.min_by(|a, b| a.1.total_cmp(&b.1))
	}

	/// Number of registered timers, armed or parked.
	pub fn timer_count(&self) -> usize {
		self.timers.len()
	}
}

impl Reactor for ManualReactor {
	fn monotonic(&self) -> f64 {
		self.now
	}

	fn register_timer(&mut self, waketime: WakeTime) -> TimerHandle {
		self.next_id += 1;
		let handle = TimerHandle(self.next_id);
		self.timers.insert(handle, waketime);
		handle
	}

	fn update_timer(&mut self, handle: TimerHandle, waketime: WakeTime) {
		if let Some(slot) = self.timers.get_mut(&handle) {
			*slot = waketime;
		}
	}

	fn unregister_timer(&mut self, handle: TimerHandle) {
		self.timers.remove(&handle);
	}
}

/// How an `UPDATE_DELAYED` request was applied.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub enum ScheduleUpdate {
	/// The macro's own callback is running; its reschedule decision will pick
	/// up the new duration and repeat flag.
	Deferred,
	/// The timer was reprogrammed directly.
	Reprogrammed(WakeTime),
	/// No timer is registered yet. The new duration and repeat flag apply
	/// once the host is ready and the timer is armed.
	Recorded,
}

/// Scheduling state of a self-scheduling macro.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayedSchedule {
	/// Seconds between wake-ups. Zero parks the timer.
	pub duration: f64,
	pub repeat: bool,
	pub handle: Option<TimerHandle>,
	/// Set while the macro runs from its own timer callback.
	pub firing: bool,
}

impl DelayedSchedule {
	pub fn new(duration: f64, repeat: bool) -> Self {
		Self {
			duration,
			repeat,
			handle: None,
			firing: false,
		}
	}

	/// Program the timer for `now + duration`, registering it on first use.
	pub fn arm(&mut self, reactor: &mut dyn Reactor) -> WakeTime {
		let wake = WakeTime::after(reactor.monotonic(), self.duration);
		match self.handle {
			Some(handle) => reactor.update_timer(handle, wake),
			None => self.handle = Some(reactor.register_timer(wake)),
		}
		wake
	}

	/// Remove the timer entirely and stop repeating. Used when the macro is
	/// uninstalled for good.
	pub fn disarm(&mut self, reactor: &mut dyn Reactor) {
		self.repeat = false;
		if let Some(handle) = self.handle.take() {
			reactor.unregister_timer(handle);
		}
	}

	/// Give up the timer without touching the reactor, leaving its wake time
	/// programmed for whoever adopts the handle.
	pub fn release(&mut self) -> Option<TimerHandle> {
		self.handle.take()
	}

	/// Take over a live timer released by a previous generation.
	pub fn adopt(&mut self, handle: TimerHandle) {
		self.handle = Some(handle);
	}

	pub fn begin_fire(&mut self) {
		self.firing = true;
	}

	/// Decide the next wake after a callback that started at `eventtime`.
	pub fn finish_fire(&mut self, eventtime: f64) -> WakeTime {
		self.firing = false;
		if self.repeat {
			WakeTime::after(eventtime, self.duration)
		} else {
			WakeTime::Never
		}
	}

	/// Apply a new duration. Inside the macro's own callback only the flags
	/// change. Otherwise a registered timer is reprogrammed immediately, and
	/// a schedule that was never armed only records the new values.
	pub fn update(
		&mut self,
		duration: f64,
		repeat: Option<bool>,
		reactor: &mut dyn Reactor,
	) -> ScheduleUpdate {
		self.duration = duration;

		if self.firing {
			self.repeat = repeat.unwrap_or(duration > 0.0);
			return ScheduleUpdate::Deferred;
		}

		if let Some(repeat) = repeat {
			self.repeat = repeat;
		}
		if self.handle.is_none() {
			return ScheduleUpdate::Recorded;
		}
		ScheduleUpdate::Reprogrammed(self.arm(reactor))
	}
}
