//! State worker.
//!
//! Owns the device state machine and is the only caller of
//! [`DeviceFsm::handle_event`]. Each pass consumes whatever the event
//! channels have accumulated and feeds it through in a fixed priority:
//! system events first, then operator commands, data updates, the save
//! handshake and finally lifecycle notices. Notices within a pass are fed
//! in lifecycle order so a run that finished between two ticks still
//! walks the machine through its intermediate states.

use embassy_time::{Duration, Timer};

use rig_core::fsm::{DeviceEvent, DeviceFsm, DeviceState, Disposition, RowAction};
use rig_core::store::StateStore;
use rig_core::types::TestMode;

use crate::events::{self, client, command, phase, sync_flag, system, update};
use crate::log::{log_error, log_info, log_warn};
use crate::status;
use crate::sync::{SCHEDULER, apply_user_command};

const STATE_TICK: Duration = Duration::from_millis(50);

const SYSTEM_MASK: u32 = system::ERROR
    | system::SYSTEM_FAULT
    | system::FAULT_CLEARED
    | system::NETWORK_DISCONNECTED
    | system::RESTART
    | system::SELF_CHECK_OK
    | system::SETTING_LOADED
    | system::LOAD_BANK_CHECKED;

const UPDATE_MASK: u32 =
    update::NEW_TEST | update::DELETE_TEST | update::DATA_ENTRY | update::USER_TUNE;

const PHASE_MASK: u32 = phase::TEST_ONGOING
    | phase::TEST_TIME_END
    | phase::DATA_CAPTURED
    | phase::VALID_DATA
    | phase::TEST_FAILED
    | phase::RETEST
    | phase::TEST_LIST_EMPTY
    | phase::PENDING_TEST_FOUND;

fn on_state_change(_from: DeviceState, to: DeviceState) {
    status::publish_device_state(to);
    log_info(to.name());
}

fn on_mode_change(mode: TestMode) {
    status::publish_test_mode(mode);
}

fn feed<S: StateStore>(machine: &DeviceFsm<'_, S>, event: DeviceEvent) {
    match machine.handle_event(event) {
        Disposition::Transitioned {
            action: Some(RowAction::LogError),
            ..
        } => log_error(event.name()),
        Disposition::Transitioned {
            action: Some(RowAction::Report),
            ..
        } => events::CLIENT_EVENTS.set_bits(client::REPORT_DUE),
        _ => {}
    }
}

/// One pass over the channels. Public so the boot path and the tests can
/// drive it without the executor.
pub fn pump<S: StateStore>(machine: &DeviceFsm<'_, S>) {
    let sys = events::SYSTEM_EVENTS.take(SYSTEM_MASK);
    for (bit, event) in [
        (system::SYSTEM_FAULT, DeviceEvent::SystemFault),
        (system::ERROR, DeviceEvent::Error),
        (system::FAULT_CLEARED, DeviceEvent::FaultCleared),
        (system::RESTART, DeviceEvent::Restart),
        (system::SELF_CHECK_OK, DeviceEvent::SelfCheckOk),
        (system::SETTING_LOADED, DeviceEvent::SettingLoaded),
        (system::LOAD_BANK_CHECKED, DeviceEvent::LoadBankChecked),
    ] {
        if sys & bit != 0 {
            feed(machine, event);
        }
    }
    if sys & system::NETWORK_DISCONNECTED != 0 {
        events::CLIENT_EVENTS.set_bits(client::DISCONNECTED);
        log_warn("presentation client lost");
    }

    let commands = events::USER_COMMAND.get() & command::ALL;
    for (bit, event) in [
        (command::AUTO, DeviceEvent::Auto),
        (command::MANUAL, DeviceEvent::Manual),
        (command::START, DeviceEvent::Start),
        (command::STOP, DeviceEvent::Stop),
        (command::PAUSE, DeviceEvent::Pause),
        (command::RESUME, DeviceEvent::Resume),
    ] {
        if commands & bit == 0 {
            continue;
        }
        match bit {
            command::AUTO => machine.set_mode(TestMode::Auto),
            command::MANUAL => machine.set_mode(TestMode::Manual),
            _ => {}
        }
        feed(machine, event);
        // Acts on the scheduler and clears the bit as acknowledgment.
        apply_user_command(bit, &SCHEDULER);
    }

    let updates = events::USER_UPDATE.take(UPDATE_MASK);
    for (bit, event) in [
        (update::NEW_TEST, DeviceEvent::NewTest),
        (update::DELETE_TEST, DeviceEvent::DeleteTest),
        (update::USER_TUNE, DeviceEvent::UserTune),
    ] {
        if updates & bit != 0 {
            feed(machine, event);
        }
    }
    if updates & update::DATA_ENTRY != 0 {
        // Settings edits land in the registry; nothing for the machine.
        log_info("settings updated by operator");
    }

    if events::SYNC_CONTROL.take(sync_flag::SAVE) != 0 {
        feed(machine, DeviceEvent::Save);
    }

    let notices = events::TEST_PHASE.take(PHASE_MASK);
    for (bit, event) in [
        (phase::TEST_ONGOING, DeviceEvent::TestRunOk),
        (phase::TEST_TIME_END, DeviceEvent::TestTimeEnd),
        (phase::DATA_CAPTURED, DeviceEvent::DataCaptured),
        (phase::VALID_DATA, DeviceEvent::ValidData),
        (phase::TEST_FAILED, DeviceEvent::TestFailed),
        (phase::RETEST, DeviceEvent::Retest),
        (phase::TEST_LIST_EMPTY, DeviceEvent::TestListEmpty),
        (phase::PENDING_TEST_FOUND, DeviceEvent::PendingTestFound),
    ] {
        if notices & bit != 0 {
            feed(machine, event);
        }
    }
}

/// The worker. The runtime supplies the store, flash-backed on the
/// target; an empty or degraded store leaves the machine booting from
/// `DeviceOn`, which is the safe default.
pub async fn run_loop<S: StateStore>(store: &'static S) -> ! {
    let mut machine = DeviceFsm::new(store);
    machine.register_state_callback(on_state_change);
    machine.register_mode_callback(on_mode_change);
    machine.resume_from_store();
    status::publish_device_state(machine.current_state());
    loop {
        pump(&machine);
        Timer::after(STATE_TICK).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_core::store::{MemoryStore, StoreKey};

    fn machine(store: &MemoryStore) -> DeviceFsm<'_, MemoryStore> {
        let mut machine = DeviceFsm::new(store);
        machine.register_state_callback(on_state_change);
        machine.register_mode_callback(on_mode_change);
        machine
    }

    fn reset_channels() {
        events::SYSTEM_EVENTS.reset();
        events::USER_COMMAND.reset();
        events::USER_UPDATE.reset();
        events::SYNC_CONTROL.reset();
        events::TEST_PHASE.reset();
        events::CLIENT_EVENTS.reset();
    }

    #[test]
    fn boot_bits_walk_the_machine_to_ready() {
        let _guard = crate::testutil::global_lock();
        reset_channels();
        let store = MemoryStore::new();
        let machine = machine(&store);

        events::SYSTEM_EVENTS.set_bits(
            system::SELF_CHECK_OK | system::SETTING_LOADED | system::LOAD_BANK_CHECKED,
        );
        pump(&machine);
        assert_eq!(machine.current_state(), DeviceState::DeviceReady);
        // Consumed, not reprocessed.
        assert_eq!(events::SYSTEM_EVENTS.get() & SYSTEM_MASK, 0);
        reset_channels();
    }

    #[test]
    fn pumped_transitions_land_in_the_store() {
        let _guard = crate::testutil::global_lock();
        reset_channels();
        let store = MemoryStore::new();
        let machine = machine(&store);
        events::SYSTEM_EVENTS.set_bits(
            system::SELF_CHECK_OK | system::SETTING_LOADED | system::LOAD_BANK_CHECKED,
        );
        pump(&machine);
        // A reboot over the same store resumes where the worker left off.
        assert_eq!(
            store.get_uint(StoreKey::DeviceState),
            Some(u32::from(DeviceState::DeviceReady.as_u8()))
        );
        reset_channels();
    }

    #[test]
    fn a_full_test_pass_lands_in_ready_next_test() {
        let _guard = crate::testutil::global_lock();
        reset_channels();
        let store = MemoryStore::new();
        let machine = machine(&store);
        events::SYSTEM_EVENTS.set_bits(
            system::SELF_CHECK_OK | system::SETTING_LOADED | system::LOAD_BANK_CHECKED,
        );
        events::USER_UPDATE.set_bits(update::NEW_TEST);
        pump(&machine);
        events::USER_COMMAND.set_bits(command::START);
        pump(&machine);
        assert_eq!(machine.current_state(), DeviceState::TestStart);

        // The whole run finished between two ticks.
        events::TEST_PHASE.set_bits(
            phase::TEST_ONGOING | phase::TEST_TIME_END | phase::DATA_CAPTURED | phase::VALID_DATA,
        );
        pump(&machine);
        assert_eq!(machine.current_state(), DeviceState::CurrentTestOk);

        events::SYNC_CONTROL.set_bits(sync_flag::SAVE);
        pump(&machine);
        assert_eq!(machine.current_state(), DeviceState::ReadyNextTest);
        reset_channels();
    }

    #[test]
    fn fault_preempts_whatever_else_is_queued() {
        let _guard = crate::testutil::global_lock();
        reset_channels();
        let store = MemoryStore::new();
        let machine = machine(&store);
        events::SYSTEM_EVENTS.set_bits(system::SYSTEM_FAULT);
        events::TEST_PHASE.set_bits(phase::TEST_ONGOING);
        pump(&machine);
        assert_eq!(machine.current_state(), DeviceState::Fault);
        reset_channels();
    }

    #[test]
    fn report_actions_raise_the_client_flag() {
        let _guard = crate::testutil::global_lock();
        reset_channels();
        let store = MemoryStore::new();
        let machine = machine(&store);
        events::SYSTEM_EVENTS.set_bits(system::SYSTEM_FAULT);
        pump(&machine);
        events::SYSTEM_EVENTS.set_bits(system::FAULT_CLEARED);
        pump(&machine);
        assert_eq!(machine.current_state(), DeviceState::RecoverData);
        assert_ne!(events::CLIENT_EVENTS.get() & client::REPORT_DUE, 0);
        reset_channels();
    }

    #[test]
    fn mode_commands_update_machine_and_published_mode() {
        let _guard = crate::testutil::global_lock();
        reset_channels();
        events::SYNC_CONTROL.reset();
        let store = MemoryStore::new();
        let machine = machine(&store);
        events::USER_COMMAND.set_bits(command::MANUAL);
        pump(&machine);
        assert_eq!(machine.mode(), TestMode::Manual);
        assert_eq!(status::test_mode(), TestMode::Manual);
        // Acknowledged.
        assert_eq!(events::USER_COMMAND.get() & command::MANUAL, 0);

        events::USER_COMMAND.set_bits(command::AUTO);
        pump(&machine);
        assert_eq!(machine.mode(), TestMode::Auto);
        assert_eq!(status::test_mode(), TestMode::Auto);
        reset_channels();
    }
}
