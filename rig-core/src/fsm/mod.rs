//! Device state machine for the test rig.
//!
//! The machine is a static ordered transition table scanned linearly on
//! every event; the first matching row wins and an event with no matching
//! row is dropped with the state unchanged. That fall-through is load
//! bearing: lifecycle notices arrive on a broadcast bus and most of them
//! are only meaningful in one or two states.
//!
//! The current state and operating mode live in single-byte atomics so any
//! worker can read them without locking. Mutation goes through
//! [`DeviceFsm::handle_event`] and [`DeviceFsm::set_mode`] only.

use portable_atomic::{AtomicU8, Ordering};

use crate::store::{StateStore, StoreKey};
use crate::types::TestMode;

/// Operating states of the rig, boot through fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DeviceState {
    DeviceOn,
    DeviceOk,
    DeviceSetup,
    DeviceReady,
    ReadyToProceed,
    TestStart,
    TestRunning,
    CurrentTestCheck,
    CurrentTestOk,
    ReadyNextTest,
    WaitingForUser,
    UserCheckRequired,
    Retest,
    SystemPaused,
    AllTestDone,
    StartFromSave,
    RecoverData,
    SystemTuning,
    Fault,
}

impl DeviceState {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DeviceState::DeviceOn),
            1 => Some(DeviceState::DeviceOk),
            2 => Some(DeviceState::DeviceSetup),
            3 => Some(DeviceState::DeviceReady),
            4 => Some(DeviceState::ReadyToProceed),
            5 => Some(DeviceState::TestStart),
            6 => Some(DeviceState::TestRunning),
            7 => Some(DeviceState::CurrentTestCheck),
            8 => Some(DeviceState::CurrentTestOk),
            9 => Some(DeviceState::ReadyNextTest),
            10 => Some(DeviceState::WaitingForUser),
            11 => Some(DeviceState::UserCheckRequired),
            12 => Some(DeviceState::Retest),
            13 => Some(DeviceState::SystemPaused),
            14 => Some(DeviceState::AllTestDone),
            15 => Some(DeviceState::StartFromSave),
            16 => Some(DeviceState::RecoverData),
            17 => Some(DeviceState::SystemTuning),
            18 => Some(DeviceState::Fault),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DeviceState::DeviceOn => "device-on",
            DeviceState::DeviceOk => "device-ok",
            DeviceState::DeviceSetup => "device-setup",
            DeviceState::DeviceReady => "device-ready",
            DeviceState::ReadyToProceed => "ready-to-proceed",
            DeviceState::TestStart => "test-start",
            DeviceState::TestRunning => "test-running",
            DeviceState::CurrentTestCheck => "current-test-check",
            DeviceState::CurrentTestOk => "current-test-ok",
            DeviceState::ReadyNextTest => "ready-next-test",
            DeviceState::WaitingForUser => "waiting-for-user",
            DeviceState::UserCheckRequired => "user-check-required",
            DeviceState::Retest => "retest",
            DeviceState::SystemPaused => "system-paused",
            DeviceState::AllTestDone => "all-test-done",
            DeviceState::StartFromSave => "start-from-save",
            DeviceState::RecoverData => "recover-data",
            DeviceState::SystemTuning => "system-tuning",
            DeviceState::Fault => "fault",
        }
    }
}

/// Transient triggers fed into the machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    // System
    Error,
    SystemFault,
    FaultCleared,
    Restart,
    // Boot
    SelfCheckOk,
    SettingLoaded,
    LoadBankChecked,
    // Test lifecycle
    TestRunOk,
    TestTimeEnd,
    DataCaptured,
    ValidData,
    TestFailed,
    Retest,
    TestListEmpty,
    PendingTestFound,
    // Operator
    Start,
    Stop,
    Auto,
    Manual,
    Pause,
    Resume,
    UserTune,
    NewTest,
    DeleteTest,
    // Data
    Save,
}

impl DeviceEvent {
    pub const fn name(self) -> &'static str {
        match self {
            DeviceEvent::Error => "error",
            DeviceEvent::SystemFault => "system-fault",
            DeviceEvent::FaultCleared => "fault-cleared",
            DeviceEvent::Restart => "restart",
            DeviceEvent::SelfCheckOk => "self-check-ok",
            DeviceEvent::SettingLoaded => "setting-loaded",
            DeviceEvent::LoadBankChecked => "load-bank-checked",
            DeviceEvent::TestRunOk => "test-run-ok",
            DeviceEvent::TestTimeEnd => "test-time-end",
            DeviceEvent::DataCaptured => "data-captured",
            DeviceEvent::ValidData => "valid-data",
            DeviceEvent::TestFailed => "test-failed",
            DeviceEvent::Retest => "retest",
            DeviceEvent::TestListEmpty => "test-list-empty",
            DeviceEvent::PendingTestFound => "pending-test-found",
            DeviceEvent::Start => "start",
            DeviceEvent::Stop => "stop",
            DeviceEvent::Auto => "auto",
            DeviceEvent::Manual => "manual",
            DeviceEvent::Pause => "pause",
            DeviceEvent::Resume => "resume",
            DeviceEvent::UserTune => "user-tune",
            DeviceEvent::NewTest => "new-test",
            DeviceEvent::DeleteTest => "delete-test",
            DeviceEvent::Save => "save",
        }
    }
}

/// Row trigger: a specific event, or any event from the row's state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    On(DeviceEvent),
    Any,
}

impl Trigger {
    const fn matches(self, event: DeviceEvent) -> bool {
        match self {
            Trigger::On(expected) => expected as u8 == event as u8,
            Trigger::Any => true,
        }
    }
}

/// Side effect attached to a row, surfaced with the disposition so the
/// caller can log or refresh its report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RowAction {
    LogError,
    Report,
}

/// One entry of the transition table.
#[derive(Copy, Clone, Debug)]
pub struct TransitionRow {
    pub from: DeviceState,
    pub trigger: Trigger,
    pub to: DeviceState,
    pub guard: Option<fn(TestMode) -> bool>,
    pub action: Option<RowAction>,
}

impl TransitionRow {
    pub const fn new(from: DeviceState, trigger: Trigger, to: DeviceState) -> Self {
        Self {
            from,
            trigger,
            to,
            guard: None,
            action: None,
        }
    }

    pub const fn guarded(
        from: DeviceState,
        trigger: Trigger,
        to: DeviceState,
        guard: fn(TestMode) -> bool,
    ) -> Self {
        Self {
            from,
            trigger,
            to,
            guard: Some(guard),
            action: None,
        }
    }

    pub const fn with_action(
        from: DeviceState,
        trigger: Trigger,
        to: DeviceState,
        action: RowAction,
    ) -> Self {
        Self {
            from,
            trigger,
            to,
            guard: None,
            action: Some(action),
        }
    }
}

fn auto_mode(mode: TestMode) -> bool {
    mode == TestMode::Auto
}

fn manual_mode(mode: TestMode) -> bool {
    mode == TestMode::Manual
}

/// The production table. Order matters: the two `ReadyNextTest` +
/// `PendingTestFound` rows are distinguished only by their mode guards and
/// are scanned auto-first.
pub static TRANSITION_TABLE: [TransitionRow; 26] = [
    TransitionRow::new(
        DeviceState::DeviceOn,
        Trigger::On(DeviceEvent::SelfCheckOk),
        DeviceState::DeviceOk,
    ),
    TransitionRow::new(
        DeviceState::DeviceOk,
        Trigger::On(DeviceEvent::SettingLoaded),
        DeviceState::DeviceSetup,
    ),
    TransitionRow::new(
        DeviceState::DeviceSetup,
        Trigger::On(DeviceEvent::LoadBankChecked),
        DeviceState::DeviceReady,
    ),
    TransitionRow::new(
        DeviceState::DeviceReady,
        Trigger::On(DeviceEvent::NewTest),
        DeviceState::ReadyToProceed,
    ),
    TransitionRow::new(
        DeviceState::ReadyToProceed,
        Trigger::On(DeviceEvent::Start),
        DeviceState::TestStart,
    ),
    TransitionRow::new(
        DeviceState::TestStart,
        Trigger::On(DeviceEvent::TestRunOk),
        DeviceState::TestRunning,
    ),
    TransitionRow::new(
        DeviceState::TestStart,
        Trigger::On(DeviceEvent::TestFailed),
        DeviceState::UserCheckRequired,
    ),
    TransitionRow::new(
        DeviceState::TestRunning,
        Trigger::On(DeviceEvent::TestFailed),
        DeviceState::Retest,
    ),
    TransitionRow::new(
        DeviceState::UserCheckRequired,
        Trigger::On(DeviceEvent::Start),
        DeviceState::TestStart,
    ),
    TransitionRow::new(
        DeviceState::CurrentTestCheck,
        Trigger::On(DeviceEvent::ValidData),
        DeviceState::CurrentTestOk,
    ),
    TransitionRow::new(
        DeviceState::CurrentTestCheck,
        Trigger::On(DeviceEvent::TestFailed),
        DeviceState::Retest,
    ),
    TransitionRow::new(
        DeviceState::CurrentTestOk,
        Trigger::On(DeviceEvent::Save),
        DeviceState::ReadyNextTest,
    ),
    TransitionRow::guarded(
        DeviceState::ReadyNextTest,
        Trigger::On(DeviceEvent::PendingTestFound),
        DeviceState::TestStart,
        auto_mode,
    ),
    TransitionRow::guarded(
        DeviceState::ReadyNextTest,
        Trigger::On(DeviceEvent::PendingTestFound),
        DeviceState::WaitingForUser,
        manual_mode,
    ),
    TransitionRow::new(
        DeviceState::ReadyNextTest,
        Trigger::On(DeviceEvent::TestListEmpty),
        DeviceState::AllTestDone,
    ),
    TransitionRow::new(
        DeviceState::CurrentTestOk,
        Trigger::On(DeviceEvent::TestFailed),
        DeviceState::RecoverData,
    ),
    TransitionRow::new(
        DeviceState::RecoverData,
        Trigger::On(DeviceEvent::Save),
        DeviceState::StartFromSave,
    ),
    TransitionRow::new(
        DeviceState::TestRunning,
        Trigger::On(DeviceEvent::TestTimeEnd),
        DeviceState::CurrentTestCheck,
    ),
    TransitionRow::new(
        DeviceState::TestRunning,
        Trigger::On(DeviceEvent::DataCaptured),
        DeviceState::CurrentTestCheck,
    ),
    TransitionRow::new(
        DeviceState::CurrentTestCheck,
        Trigger::On(DeviceEvent::TestTimeEnd),
        DeviceState::CurrentTestCheck,
    ),
    TransitionRow::with_action(
        DeviceState::AllTestDone,
        Trigger::On(DeviceEvent::TestFailed),
        DeviceState::RecoverData,
        RowAction::LogError,
    ),
    TransitionRow::with_action(
        DeviceState::SystemTuning,
        Trigger::On(DeviceEvent::Auto),
        DeviceState::RecoverData,
        RowAction::Report,
    ),
    TransitionRow::with_action(
        DeviceState::Fault,
        Trigger::On(DeviceEvent::FaultCleared),
        DeviceState::RecoverData,
        RowAction::Report,
    ),
    TransitionRow::with_action(
        DeviceState::SystemPaused,
        Trigger::On(DeviceEvent::Auto),
        DeviceState::StartFromSave,
        RowAction::Report,
    ),
    TransitionRow::new(
        DeviceState::StartFromSave,
        Trigger::On(DeviceEvent::PendingTestFound),
        DeviceState::TestStart,
    ),
    TransitionRow::with_action(
        DeviceState::Fault,
        Trigger::On(DeviceEvent::Restart),
        DeviceState::DeviceOn,
        RowAction::Report,
    ),
];

/// Self-check attempts tolerated before the boot short-circuit gives up
/// and reports a fault instead.
pub const MAX_SELF_CHECK_RETRIES: u8 = 3;

/// Result of feeding one event through the machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// A row (or special case) fired; the state may or may not differ.
    Transitioned {
        from: DeviceState,
        to: DeviceState,
        action: Option<RowAction>,
    },
    /// No row matched; the event was dropped and the state is unchanged.
    Ignored,
}

/// The state machine service. One instance owns the state, mode and retry
/// cells plus the persistence handle; workers share it by reference.
pub struct DeviceFsm<'a, S: StateStore> {
    state: AtomicU8,
    prior_state: AtomicU8,
    mode: AtomicU8,
    self_check_retries: AtomicU8,
    table: &'static [TransitionRow],
    store: &'a S,
    state_changed: Option<fn(DeviceState, DeviceState)>,
    mode_changed: Option<fn(TestMode)>,
}

impl<'a, S: StateStore> DeviceFsm<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self::with_table(store, &TRANSITION_TABLE)
    }

    /// Builds a machine over a caller-supplied table. The production table
    /// is [`TRANSITION_TABLE`]; tests substitute reduced ones.
    pub fn with_table(store: &'a S, table: &'static [TransitionRow]) -> Self {
        Self {
            state: AtomicU8::new(DeviceState::DeviceOn.as_u8()),
            prior_state: AtomicU8::new(DeviceState::DeviceOn.as_u8()),
            mode: AtomicU8::new(0),
            self_check_retries: AtomicU8::new(0),
            table,
            store,
            state_changed: None,
            mode_changed: None,
        }
    }

    /// Restores the last persisted state, if the store has one. Called once
    /// before workers start; a missing or corrupt value leaves the machine
    /// at `DeviceOn`.
    pub fn resume_from_store(&self) {
        if let Some(raw) = self.store.get_uint(StoreKey::DeviceState)
            && let Some(state) = DeviceState::from_u8(raw as u8)
        {
            self.state.store(state.as_u8(), Ordering::Release);
        }
    }

    pub fn register_state_callback(&mut self, callback: fn(DeviceState, DeviceState)) {
        self.state_changed = Some(callback);
    }

    pub fn register_mode_callback(&mut self, callback: fn(TestMode)) {
        self.mode_changed = Some(callback);
    }

    pub fn current_state(&self) -> DeviceState {
        // The cell only ever holds values produced by `DeviceState::as_u8`.
        DeviceState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(DeviceState::DeviceOn)
    }

    /// The state the machine was in before the last unconditional jump.
    pub fn prior_state(&self) -> DeviceState {
        DeviceState::from_u8(self.prior_state.load(Ordering::Acquire))
            .unwrap_or(DeviceState::DeviceOn)
    }

    pub fn mode(&self) -> TestMode {
        if self.mode.load(Ordering::Acquire) == 0 {
            TestMode::Auto
        } else {
            TestMode::Manual
        }
    }

    pub fn set_mode(&self, mode: TestMode) {
        let raw = match mode {
            TestMode::Auto => 0,
            TestMode::Manual => 1,
        };
        let previous = self.mode.swap(raw, Ordering::AcqRel);
        if previous != raw
            && let Some(callback) = self.mode_changed
        {
            callback(mode);
        }
    }

    pub fn self_check_retries(&self) -> u8 {
        self.self_check_retries.load(Ordering::Relaxed)
    }

    /// Feeds one event through the machine.
    ///
    /// Order of evaluation:
    /// 1. `SelfCheckOk` in `DeviceOn` advances to `DeviceOk` without
    ///    consulting the table, bumping a bounded retry counter. Past the
    ///    bound the machine reports a fault instead of looping.
    /// 2. `SystemFault`, `Pause` and `UserTune` jump unconditionally from
    ///    any state.
    /// 3. Linear table scan, first matching row with a passing guard wins.
    /// 4. No match: the event is dropped, state unchanged.
    pub fn handle_event(&self, event: DeviceEvent) -> Disposition {
        let current = self.current_state();

        if event == DeviceEvent::SelfCheckOk && current == DeviceState::DeviceOn {
            let attempts = self.self_check_retries.fetch_add(1, Ordering::AcqRel);
            if attempts >= MAX_SELF_CHECK_RETRIES {
                self.self_check_retries
                    .store(MAX_SELF_CHECK_RETRIES, Ordering::Release);
                return self.transition(current, DeviceState::Fault);
            }
            return self.transition(current, DeviceState::DeviceOk);
        }

        match event {
            DeviceEvent::SystemFault => return self.jump(current, DeviceState::Fault),
            DeviceEvent::Pause => return self.jump(current, DeviceState::SystemPaused),
            DeviceEvent::UserTune => return self.jump(current, DeviceState::SystemTuning),
            _ => {}
        }

        let mode = self.mode();
        for row in self.table {
            if row.from == current
                && row.trigger.matches(event)
                && row.guard.is_none_or(|guard| guard(mode))
            {
                self.self_check_retries.store(0, Ordering::Release);
                return self.transition_with(current, row.to, row.action);
            }
        }

        Disposition::Ignored
    }

    fn jump(&self, from: DeviceState, to: DeviceState) -> Disposition {
        self.prior_state.store(from.as_u8(), Ordering::Release);
        self.transition(from, to)
    }

    fn transition(&self, from: DeviceState, to: DeviceState) -> Disposition {
        self.transition_with(from, to, None)
    }

    fn transition_with(
        &self,
        from: DeviceState,
        to: DeviceState,
        action: Option<RowAction>,
    ) -> Disposition {
        self.state.store(to.as_u8(), Ordering::Release);
        self.persist(to);
        if from != to
            && let Some(callback) = self.state_changed
        {
            callback(from, to);
        }
        Disposition::Transitioned { from, to, action }
    }

    fn persist(&self, state: DeviceState) {
        // Best effort: a failing store degrades to RAM-only operation.
        let _ = self
            .store
            .put_uint(StoreKey::DeviceState, u32::from(state.as_u8()));
    }
}
