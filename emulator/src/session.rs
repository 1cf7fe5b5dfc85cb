//! Interactive session driving the core crate against a simulated UPS.
//!
//! The session composes the same pieces the firmware workers do: the
//! active-test table, the packed status word and the device state
//! machine, with a millisecond counter standing in for the hardware
//! clock. The simulated UPS responds to a power cut with a configurable
//! switchover or battery-hold interval, so every scenario the bench can
//! produce is reproducible from the keyboard.

use rig_core::fsm::{DeviceEvent, DeviceFsm, DeviceState};
use rig_core::lifecycle::{
    CaptureWindow, CycleConfig, CycleNotice, RecordBank, TestCycle, TestIo, TestOutcome,
};
use rig_core::load::{LoadPlan, load_plan};
use rig_core::sched::{ActiveTestTable, MAX_TEST, RequiredTest, SlotError};
use rig_core::settings::{SpecSetup, TestSetup, TuningSetup};
use rig_core::status::{
    SchedulerStatus, SlotStatus, TesterStatus, clear_slot, decode_slot, encode_slot,
    next_pending_test, update_scheduler_status, update_tester_status,
};
use rig_core::store::MemoryStore;
use rig_core::types::{LoadLevel, TestMode, TestType};

const POLL_QUANTUM_MS: u64 = 100;

pub const HELP_TEXT: &[&str] = &[
    "mode <auto|manual>           - select test sequencing mode",
    "submit <switch|backup> <0|25|50|75|100> - queue a test at a load level",
    "delete <switch|backup> <load>           - remove a queued test",
    "start                        - start the campaign (manual: one test)",
    "pause | resume               - park or restart the rig",
    "run                          - advance the simulation until it parks",
    "sim switchover <ms>          - simulated inverter pickup delay",
    "sim hold <ms>                - simulated battery hold time",
    "set duration <ms>            - per-test run duration",
    "set switch-window <min> <max>- switch-time acceptance window",
    "set backup-window <min> <max>- backup-time acceptance window",
    "set rating <va>              - UPS nameplate rating",
    "status                       - machine state, mode and slot table",
    "records                      - recent test records",
    "help | exit",
];

/// UPS model: a power cut opens the capture window, the configured
/// interval closes it.
struct SimulatedUps {
    interval_ms: u64,
    clock_ms: u64,
    window: CaptureWindow,
    mains_present: bool,
}

impl SimulatedUps {
    fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            clock_ms: 0,
            window: CaptureWindow::default(),
            mains_present: true,
        }
    }

    fn tick(&mut self, now_ms: u64) {
        self.clock_ms = now_ms;
        if !self.mains_present
            && self.window.start_ms != 0
            && self.window.end_ms == 0
            && now_ms >= self.window.start_ms + self.interval_ms
        {
            self.window.end_ms = self.window.start_ms + self.interval_ms;
            self.window.capture_ok = true;
        }
    }
}

impl TestIo for SimulatedUps {
    fn apply_load(&mut self, _plan: LoadPlan) {}

    fn cut_power(&mut self) {
        self.mains_present = false;
        self.window.start_ms = self.clock_ms.max(1);
    }

    fn restore_power(&mut self) {
        self.mains_present = true;
    }

    fn pulse_end_signal(&mut self) {}
}

pub struct Session {
    machine: DeviceFsm<'static, MemoryStore>,
    table: ActiveTestTable,
    word: u64,
    attempts: [u8; MAX_TEST],
    records: RecordBank,
    spec: SpecSetup,
    test: TestSetup,
    tuning: TuningSetup,
    clock_ms: u64,
    switchover_ms: u64,
    hold_ms: u64,
}

impl Session {
    pub fn new() -> Self {
        let store: &'static MemoryStore = Box::leak(Box::new(MemoryStore::new()));
        let machine = DeviceFsm::new(store);
        machine.handle_event(DeviceEvent::SelfCheckOk);
        machine.handle_event(DeviceEvent::SettingLoaded);
        machine.handle_event(DeviceEvent::LoadBankChecked);

        let mut test = TestSetup::default();
        // Bench-scale defaults so `run` finishes in a handful of polls.
        let _ = test.set_test_duration(1_000, 0);
        let _ = test.set_switch_window(10, 500, 0);

        Self {
            machine,
            table: ActiveTestTable::new(),
            word: 0,
            attempts: [0; MAX_TEST],
            records: RecordBank::new(),
            spec: SpecSetup::default(),
            test,
            tuning: TuningSetup::default(),
            clock_ms: 0,
            switchover_ms: 120,
            hold_ms: 60_000,
        }
    }

    pub fn handle_command(&mut self, line: &str) -> Vec<String> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Vec::new();
        };
        let args: Vec<&str> = parts.collect();

        match command.to_ascii_lowercase().as_str() {
            "help" => HELP_TEXT.iter().map(|&s| s.to_string()).collect(),
            "mode" => self.cmd_mode(&args),
            "submit" => self.cmd_submit(&args),
            "delete" => self.cmd_delete(&args),
            "start" => self.cmd_start(),
            "pause" => self.cmd_pause(),
            "resume" => self.cmd_resume(),
            "run" => self.cmd_run(),
            "sim" => self.cmd_sim(&args),
            "set" => self.cmd_set(&args),
            "status" => self.cmd_status(),
            "records" => self.cmd_records(),
            other => vec![format!("ERR unknown command `{other}`")],
        }
    }

    fn cmd_mode(&mut self, args: &[&str]) -> Vec<String> {
        match args {
            ["auto"] => {
                self.machine.set_mode(TestMode::Auto);
                self.machine.handle_event(DeviceEvent::Auto);
                vec!["OK mode auto".to_string()]
            }
            ["manual"] => {
                self.machine.set_mode(TestMode::Manual);
                self.machine.handle_event(DeviceEvent::Manual);
                vec!["OK mode manual".to_string()]
            }
            _ => vec!["ERR usage: mode <auto|manual>".to_string()],
        }
    }

    fn cmd_submit(&mut self, args: &[&str]) -> Vec<String> {
        let Some(request) = parse_request(args) else {
            return vec!["ERR usage: submit <switch|backup> <0|25|50|75|100>".to_string()];
        };
        match self.table.insert(request) {
            Ok(slot) => {
                self.word = encode_slot(
                    self.word,
                    slot,
                    SlotStatus {
                        test_type: request.test_type,
                        load: request.load,
                        scheduler: SchedulerStatus::Pending,
                        tester: TesterStatus::NotStarted,
                    },
                );
                self.attempts[slot] = 0;
                self.machine.handle_event(DeviceEvent::NewTest);
                vec![format!("OK queued in slot {slot}")]
            }
            Err(SlotError::Duplicate) => vec!["ERR already queued".to_string()],
            Err(SlotError::TableFull) => vec!["ERR table full".to_string()],
        }
    }

    fn cmd_delete(&mut self, args: &[&str]) -> Vec<String> {
        let Some(request) = parse_request(args) else {
            return vec!["ERR usage: delete <switch|backup> <load>".to_string()];
        };
        match self.table.find(request.test_type, request.load) {
            Some(slot) => {
                self.table.deactivate(slot);
                self.table.sweep();
                self.word = clear_slot(self.word, slot);
                self.machine.handle_event(DeviceEvent::DeleteTest);
                vec![format!("OK removed slot {slot}")]
            }
            None => vec!["ERR no such test".to_string()],
        }
    }

    fn cmd_start(&mut self) -> Vec<String> {
        self.machine.handle_event(DeviceEvent::Start);
        vec![format!("OK state {}", self.machine.current_state().name())]
    }

    fn cmd_pause(&mut self) -> Vec<String> {
        self.machine.handle_event(DeviceEvent::Pause);
        vec![format!("OK state {}", self.machine.current_state().name())]
    }

    fn cmd_resume(&mut self) -> Vec<String> {
        self.machine.handle_event(DeviceEvent::Auto);
        vec![format!("OK state {}", self.machine.current_state().name())]
    }

    fn cmd_sim(&mut self, args: &[&str]) -> Vec<String> {
        match args {
            ["switchover", value] => match value.parse() {
                Ok(ms) => {
                    self.switchover_ms = ms;
                    vec![format!("OK switchover {ms} ms")]
                }
                Err(_) => vec!["ERR bad value".to_string()],
            },
            ["hold", value] => match value.parse() {
                Ok(ms) => {
                    self.hold_ms = ms;
                    vec![format!("OK hold {ms} ms")]
                }
                Err(_) => vec!["ERR bad value".to_string()],
            },
            _ => vec!["ERR usage: sim <switchover|hold> <ms>".to_string()],
        }
    }

    fn cmd_set(&mut self, args: &[&str]) -> Vec<String> {
        let result = match args {
            ["duration", value] => value
                .parse()
                .map_err(|_| ())
                .and_then(|ms| self.test.set_test_duration(ms, self.clock_ms).map_err(|_| ())),
            ["switch-window", min, max] => parse_pair(min, max)
                .and_then(|(lo, hi)| self.test.set_switch_window(lo, hi, self.clock_ms).map_err(|_| ())),
            ["backup-window", min, max] => parse_pair(min, max)
                .and_then(|(lo, hi)| self.test.set_backup_window(lo, hi, self.clock_ms).map_err(|_| ())),
            ["rating", value] => value
                .parse()
                .map_err(|_| ())
                .and_then(|va| self.spec.set_rating_va(va, self.clock_ms).map_err(|_| ())),
            _ => {
                return vec![
                    "ERR usage: set <duration|switch-window|backup-window|rating> ...".to_string(),
                ];
            }
        };
        match result {
            Ok(()) => vec!["OK".to_string()],
            Err(()) => vec!["ERR value out of range".to_string()],
        }
    }

    fn cmd_status(&mut self) -> Vec<String> {
        let mut lines = vec![
            format!("state: {}", self.machine.current_state().name()),
            format!(
                "mode: {}",
                match self.machine.mode() {
                    TestMode::Auto => "auto",
                    TestMode::Manual => "manual",
                }
            ),
            format!("clock: {} ms", self.clock_ms),
        ];
        let mut any = false;
        for slot in 0..MAX_TEST {
            if let Some(status) = decode_slot(self.word, slot) {
                any = true;
                lines.push(format!(
                    "slot {slot}: {:?} {}% {:?}/{:?}",
                    status.test_type,
                    status.load.percent(),
                    status.scheduler,
                    status.tester,
                ));
            }
        }
        if !any {
            lines.push("slots: empty".to_string());
        }
        lines
    }

    fn cmd_records(&self) -> Vec<String> {
        if self.records.is_empty() {
            return vec!["no records".to_string()];
        }
        self.records
            .oldest_first()
            .map(|record| {
                format!(
                    "test {} at {} ms: {} ms at {}% load, {}",
                    record.test_no,
                    record.timestamp_ms,
                    record.elapsed_ms,
                    record.load_percent,
                    if record.valid { "valid" } else { "invalid" },
                )
            })
            .collect()
    }

    /// Advances the simulation until the campaign parks: all tests done,
    /// waiting for the operator, or a retest budget exhausted.
    fn cmd_run(&mut self) -> Vec<String> {
        if self.machine.current_state() == DeviceState::ReadyToProceed {
            self.machine.handle_event(DeviceEvent::Start);
        }
        let mut lines = Vec::new();
        while let Some(pending) = next_pending_test(self.word) {
            let verdict_lines = self.run_single(pending.slot, pending.test_type, pending.load);
            lines.extend(verdict_lines);

            if next_pending_test(self.word).is_some() {
                self.machine.handle_event(DeviceEvent::PendingTestFound);
                if self.machine.current_state() == DeviceState::WaitingForUser {
                    lines.push("waiting for operator (manual mode)".to_string());
                    break;
                }
            } else if !self.table.is_empty() {
                // Remaining entries are parked retests past their budget.
                break;
            } else {
                self.machine.handle_event(DeviceEvent::TestListEmpty);
                lines.push("all tests done".to_string());
            }
        }
        if lines.is_empty() {
            lines.push("nothing to run".to_string());
        }
        lines.push(format!("state: {}", self.machine.current_state().name()));
        lines
    }

    fn run_single(&mut self, slot: usize, test_type: TestType, load: LoadLevel) -> Vec<String> {
        let interval = match test_type {
            TestType::BackupTime => self.hold_ms,
            _ => self.switchover_ms,
        };
        let tolerance = match test_type {
            TestType::BackupTime => self.test.backup_window,
            _ => self.test.switch_window,
        };
        let config = CycleConfig {
            test_no: slot as u8 + 1,
            load,
            plan: load_plan(load.apply_to(self.test.test_va_rating), &self.spec, &self.tuning),
            duration_ms: self.test.test_duration_ms,
            tolerance,
        };

        self.word = update_tester_status(self.word, slot, TesterStatus::Running);
        let mut ups = SimulatedUps::new(interval);
        let mut cycle = TestCycle::new(config);
        while !cycle.is_terminal() {
            ups.tick(self.clock_ms);
            let window = ups.window;
            for notice in cycle.advance(self.clock_ms, &window, &mut ups) {
                self.machine.handle_event(notice_event(notice));
            }
            self.clock_ms += POLL_QUANTUM_MS;
        }

        if let Some(record) = cycle.record() {
            self.records.record(*record);
        }

        let mut lines = Vec::new();
        match cycle.outcome() {
            Some(TestOutcome::Successful) => {
                self.word = update_tester_status(self.word, slot, TesterStatus::Success);
                self.word = update_scheduler_status(self.word, slot, SchedulerStatus::Done);
                self.table.deactivate(slot);
                self.table.sweep();
                self.machine.handle_event(DeviceEvent::Save);
                let elapsed = cycle.record().map_or(0, |record| record.elapsed_ms);
                lines.push(format!(
                    "slot {slot}: {test_type:?} at {}% passed, {elapsed} ms",
                    load.percent()
                ));
            }
            Some(TestOutcome::Failed) | None => {
                self.word = update_tester_status(self.word, slot, TesterStatus::Failed);
                self.attempts[slot] += 1;
                if self.attempts[slot] <= self.test.max_retest {
                    self.word = update_scheduler_status(self.word, slot, SchedulerStatus::Retest);
                    self.word = update_scheduler_status(self.word, slot, SchedulerStatus::Pending);
                    self.machine.handle_event(DeviceEvent::Retest);
                    lines.push(format!(
                        "slot {slot}: {test_type:?} failed, retest {} of {}",
                        self.attempts[slot], self.test.max_retest
                    ));
                } else {
                    self.word = update_scheduler_status(self.word, slot, SchedulerStatus::Done);
                    self.table.deactivate(slot);
                    self.table.sweep();
                    lines.push(format!(
                        "slot {slot}: {test_type:?} failed, retest budget exhausted"
                    ));
                }
            }
        }
        lines
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

fn notice_event(notice: CycleNotice) -> DeviceEvent {
    match notice {
        CycleNotice::TestOngoing => DeviceEvent::TestRunOk,
        CycleNotice::TestTimeEnd => DeviceEvent::TestTimeEnd,
        CycleNotice::DataCaptured => DeviceEvent::DataCaptured,
        CycleNotice::ValidData => DeviceEvent::ValidData,
        CycleNotice::TestFailed => DeviceEvent::TestFailed,
    }
}

fn parse_request(args: &[&str]) -> Option<RequiredTest> {
    let [kind, load] = args else {
        return None;
    };
    let test_type = match kind.to_ascii_lowercase().as_str() {
        "switch" => TestType::SwitchTime,
        "backup" => TestType::BackupTime,
        _ => return None,
    };
    let load = match *load {
        "0" => LoadLevel::L0,
        "25" => LoadLevel::L25,
        "50" => LoadLevel::L50,
        "75" => LoadLevel::L75,
        "100" => LoadLevel::L100,
        _ => return None,
    };
    Some(RequiredTest { test_type, load })
}

fn parse_pair(min: &str, max: &str) -> Result<(u32, u32), ()> {
    match (min.parse(), max.parse()) {
        (Ok(lo), Ok(hi)) => Ok((lo, hi)),
        _ => Err(()),
    }
}
