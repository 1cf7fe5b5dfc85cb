use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::Flash;
use embassy_stm32::gpio::{Level, Output, OutputType, Pull, Speed};
use embassy_stm32::time::hz;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};

use crate::events::{self, system};
use crate::hw::RigIo;
use crate::log::log_info;
use crate::settings;
use crate::state;
use crate::store::FlashStore;
use crate::sync::observer;
use crate::testers;

mod capture_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

static STORE: FlashStore = FlashStore::new();

#[embassy_executor::task]
async fn state_task() -> ! {
    state::run_loop(&STORE).await
}

#[embassy_executor::task]
async fn observer_task() -> ! {
    observer::run_loop().await
}

#[embassy_executor::task]
async fn tester_task(mut io: RigIo) -> ! {
    testers::run_loop(&mut io).await
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        PA0,
        PA1,
        PA4,
        PA5,
        PA6,
        PB0,
        PB1,
        PB2,
        PB3,
        TIM3,
        EXTI0,
        EXTI1,
        FLASH,
        ..
    } = hal::init(config);

    STORE.attach(Flash::new_blocking(FLASH));

    let hardware = settings::hardware();
    let pwm_pin = PwmPin::new_ch1(PA6, OutputType::PushPull);
    let pwm = SimplePwm::new(
        TIM3,
        Some(pwm_pin),
        None,
        None,
        None,
        hz(hardware.pwm_frequency_hz),
        Default::default(),
    );

    let io = RigIo::new(
        [
            Output::new(PB0, Level::Low, Speed::Low),
            Output::new(PB1, Level::Low, Speed::Low),
            Output::new(PB2, Level::Low, Speed::Low),
            Output::new(PB3, Level::Low, Speed::Low),
        ],
        Output::new(PA4, Level::Low, Speed::Low),
        Output::new(PA5, Level::Low, Speed::Low),
        pwm,
    );

    let mains_sense = ExtiInput::new(PA0, EXTI0, Pull::Up);
    let inverter_sense = ExtiInput::new(PA1, EXTI1, Pull::Up);

    spawner
        .spawn(state_task())
        .expect("failed to spawn state task");
    spawner
        .spawn(observer_task())
        .expect("failed to spawn observer task");
    spawner
        .spawn(tester_task(io))
        .expect("failed to spawn tester task");
    spawner
        .spawn(capture_task::run(mains_sense, inverter_sense))
        .expect("failed to spawn capture task");

    // Boot notices. Settings come up from their compiled-in defaults, so
    // the self-check trio is raised as soon as the workers are running.
    events::SYSTEM_EVENTS.set_bits(system::SELF_CHECK_OK);
    events::SYSTEM_EVENTS.set_bits(system::SETTING_LOADED);
    events::SYSTEM_EVENTS.set_bits(system::LOAD_BANK_CHECKED);
    log_info("boot sequence reported");

    core::future::pending::<()>().await;
}
