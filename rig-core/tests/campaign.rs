//! Campaign bookkeeping across the table, the status word and the state
//! machine, the way the firmware's scheduler workers compose them.

use rig_core::fsm::{DeviceEvent, DeviceFsm, DeviceState};
use rig_core::sched::{ActiveTestTable, RequiredTest, SlotError};
use rig_core::status::{
    SchedulerStatus, SlotStatus, TesterStatus, decode_slot, encode_slot, next_pending_test,
    update_scheduler_status, update_tester_status,
};
use rig_core::store::MemoryStore;
use rig_core::types::{LoadLevel, TestMode, TestType};

fn submit(table: &mut ActiveTestTable, word: &mut u64, request: RequiredTest) -> usize {
    let slot = table.insert(request).unwrap();
    *word = encode_slot(
        *word,
        slot,
        SlotStatus {
            test_type: request.test_type,
            load: request.load,
            scheduler: SchedulerStatus::Pending,
            tester: TesterStatus::NotStarted,
        },
    );
    slot
}

#[test]
fn auto_campaign_drains_the_pending_list() {
    let store = MemoryStore::new();
    let machine = DeviceFsm::new(&store);
    machine.set_mode(TestMode::Auto);

    let mut table = ActiveTestTable::new();
    let mut word = 0u64;
    submit(
        &mut table,
        &mut word,
        RequiredTest {
            test_type: TestType::SwitchTime,
            load: LoadLevel::L25,
        },
    );
    submit(
        &mut table,
        &mut word,
        RequiredTest {
            test_type: TestType::SwitchTime,
            load: LoadLevel::L50,
        },
    );

    machine.handle_event(DeviceEvent::SelfCheckOk);
    machine.handle_event(DeviceEvent::SettingLoaded);
    machine.handle_event(DeviceEvent::LoadBankChecked);
    machine.handle_event(DeviceEvent::NewTest);
    machine.handle_event(DeviceEvent::Start);
    assert_eq!(machine.current_state(), DeviceState::TestStart);

    // Run each pending test to completion, the way the observer does.
    while let Some(pending) = next_pending_test(word) {
        machine.handle_event(DeviceEvent::TestRunOk);
        word = update_tester_status(word, pending.slot, TesterStatus::Running);
        machine.handle_event(DeviceEvent::TestTimeEnd);
        machine.handle_event(DeviceEvent::ValidData);
        word = update_tester_status(word, pending.slot, TesterStatus::Success);
        word = update_scheduler_status(word, pending.slot, SchedulerStatus::Done);
        table.deactivate(pending.slot);
        machine.handle_event(DeviceEvent::Save);
        assert_eq!(machine.current_state(), DeviceState::ReadyNextTest);

        if next_pending_test(word).is_some() {
            machine.handle_event(DeviceEvent::PendingTestFound);
            assert_eq!(machine.current_state(), DeviceState::TestStart);
        }
    }

    machine.handle_event(DeviceEvent::TestListEmpty);
    assert_eq!(machine.current_state(), DeviceState::AllTestDone);
    assert!(table.is_empty());

    // Both slots report done/success to the presentation layer.
    for slot in 0..2 {
        let status = decode_slot(word, slot).unwrap();
        assert_eq!(status.scheduler, SchedulerStatus::Done);
        assert_eq!(status.tester, TesterStatus::Success);
    }
}

#[test]
fn manual_campaign_parks_between_tests() {
    let store = MemoryStore::new();
    let machine = DeviceFsm::new(&store);
    machine.set_mode(TestMode::Manual);

    let mut table = ActiveTestTable::new();
    let mut word = 0u64;
    submit(
        &mut table,
        &mut word,
        RequiredTest {
            test_type: TestType::BackupTime,
            load: LoadLevel::L50,
        },
    );
    submit(
        &mut table,
        &mut word,
        RequiredTest {
            test_type: TestType::BackupTime,
            load: LoadLevel::L100,
        },
    );

    machine.handle_event(DeviceEvent::SelfCheckOk);
    machine.handle_event(DeviceEvent::SettingLoaded);
    machine.handle_event(DeviceEvent::LoadBankChecked);
    machine.handle_event(DeviceEvent::NewTest);
    machine.handle_event(DeviceEvent::Start);

    let first = next_pending_test(word).unwrap();
    machine.handle_event(DeviceEvent::TestRunOk);
    machine.handle_event(DeviceEvent::TestTimeEnd);
    machine.handle_event(DeviceEvent::ValidData);
    word = update_scheduler_status(word, first.slot, SchedulerStatus::Done);
    machine.handle_event(DeviceEvent::Save);

    // Manual mode waits for the operator even though work remains.
    assert!(next_pending_test(word).is_some());
    machine.handle_event(DeviceEvent::PendingTestFound);
    assert_eq!(machine.current_state(), DeviceState::WaitingForUser);
}

#[test]
fn duplicate_submission_cannot_shadow_a_queued_test() {
    let mut table = ActiveTestTable::new();
    let mut word = 0u64;
    let request = RequiredTest {
        test_type: TestType::SwitchTime,
        load: LoadLevel::L75,
    };
    let slot = submit(&mut table, &mut word, request);
    assert_eq!(table.insert(request), Err(SlotError::Duplicate));
    // The original slot is untouched.
    let status = decode_slot(word, slot).unwrap();
    assert_eq!(status.scheduler, SchedulerStatus::Pending);
    assert_eq!(status.tester, TesterStatus::NotStarted);
}

#[test]
fn retest_bookkeeping_is_bounded() {
    const MAX_RETEST: u8 = 2;

    let mut table = ActiveTestTable::new();
    let mut word = 0u64;
    let slot = submit(
        &mut table,
        &mut word,
        RequiredTest {
            test_type: TestType::SwitchTime,
            load: LoadLevel::L50,
        },
    );

    let mut attempts = 0u8;
    loop {
        // Every attempt fails.
        word = update_tester_status(word, slot, TesterStatus::Failed);
        if attempts < MAX_RETEST {
            attempts += 1;
            word = update_scheduler_status(word, slot, SchedulerStatus::Retest);
            // A retest is picked up again on the next scan.
            word = update_scheduler_status(word, slot, SchedulerStatus::Pending);
        } else {
            word = update_scheduler_status(word, slot, SchedulerStatus::Done);
            table.deactivate(slot);
            break;
        }
    }

    assert_eq!(attempts, MAX_RETEST);
    let status = decode_slot(word, slot).unwrap();
    assert_eq!(status.scheduler, SchedulerStatus::Done);
    assert_eq!(status.tester, TesterStatus::Failed);
    assert_eq!(next_pending_test(word), None);
}

#[test]
fn reboot_resumes_the_persisted_state() {
    let store = MemoryStore::new();
    {
        let machine = DeviceFsm::new(&store);
        machine.handle_event(DeviceEvent::SelfCheckOk);
        machine.handle_event(DeviceEvent::SettingLoaded);
        machine.handle_event(DeviceEvent::LoadBankChecked);
        machine.handle_event(DeviceEvent::NewTest);
        assert_eq!(machine.current_state(), DeviceState::ReadyToProceed);
    }

    // Power cycle: a fresh machine over the same store.
    let machine = DeviceFsm::new(&store);
    assert_eq!(machine.current_state(), DeviceState::DeviceOn);
    machine.resume_from_store();
    assert_eq!(machine.current_state(), DeviceState::ReadyToProceed);
    machine.handle_event(DeviceEvent::Start);
    assert_eq!(machine.current_state(), DeviceState::TestStart);
}
