//! Bench hardware driver.
//!
//! Maps the lifecycle engine's abstract actions onto the rig: four bank
//! select relays, the PWM trim channel, the mains relay and the pulse
//! line that tells the bench recorder a run is over.

use cortex_m::asm;
use embassy_stm32::gpio::Output;
use embassy_stm32::peripherals::TIM3;
use embassy_stm32::timer::simple_pwm::SimplePwm;

use rig_core::lifecycle::TestIo;
use rig_core::load::{LoadPlan, PWM_FULL_SCALE};

/// End-signal pulse width in core cycles, roughly half a millisecond at
/// the default clock.
const END_PULSE_CYCLES: u32 = 32_000;

pub struct RigIo {
    banks: [Output<'static>; 4],
    mains_relay: Output<'static>,
    end_signal: Output<'static>,
    pwm: SimplePwm<'static, TIM3>,
}

impl RigIo {
    pub fn new(
        banks: [Output<'static>; 4],
        mains_relay: Output<'static>,
        end_signal: Output<'static>,
        mut pwm: SimplePwm<'static, TIM3>,
    ) -> Self {
        pwm.ch1().enable();
        Self {
            banks,
            mains_relay,
            end_signal,
            pwm,
        }
    }
}

impl TestIo for RigIo {
    fn apply_load(&mut self, plan: LoadPlan) {
        let mut channel = self.pwm.ch1();
        let duty = u32::from(plan.pwm_value) * u32::from(channel.max_duty_cycle())
            / u32::from(PWM_FULL_SCALE);
        channel.set_duty_cycle(duty as u16);
        for (index, bank) in self.banks.iter_mut().enumerate() {
            if index < usize::from(plan.banks) {
                bank.set_high();
            } else {
                bank.set_low();
            }
        }
    }

    // The relay is energized to break mains; de-energized fails safe to
    // pass-through.
    fn cut_power(&mut self) {
        self.mains_relay.set_high();
    }

    fn restore_power(&mut self) {
        self.mains_relay.set_low();
    }

    fn pulse_end_signal(&mut self) {
        self.end_signal.set_high();
        asm::delay(END_PULSE_CYCLES);
        self.end_signal.set_low();
    }
}
