//! Edge capture task.
//!
//! Watches the two sense lines and stamps the capture cells. Mains loss
//! opens both timing windows; the inverter line closes the switch window
//! on pickup and the backup window on shutdown. Chatter is rejected per
//! line by an [`EdgeFilter`], so the task never sleeps between edges and
//! a pickup arriving milliseconds after mains loss is still seen.

use embassy_futures::select::{Either, select};
use embassy_stm32::exti::ExtiInput;
use embassy_time::Instant;

use crate::testers::capture::{BACKUP_CAPTURE, EdgeFilter, SWITCH_CAPTURE};

/// Edges closer together than this on one line are relay chatter.
const DEBOUNCE_MS: u64 = 100;

#[embassy_executor::task]
pub(crate) async fn run(
    mut mains_sense: ExtiInput<'static>,
    mut inverter_sense: ExtiInput<'static>,
) -> ! {
    let mut mains_filter = EdgeFilter::new(DEBOUNCE_MS);
    let mut inverter_filter = EdgeFilter::new(DEBOUNCE_MS);
    loop {
        match select(
            mains_sense.wait_for_falling_edge(),
            inverter_sense.wait_for_any_edge(),
        )
        .await
        {
            Either::First(()) => {
                let now_ms = Instant::now().as_millis();
                if mains_filter.accept(now_ms) {
                    SWITCH_CAPTURE.stamp_start(now_ms);
                    BACKUP_CAPTURE.stamp_start(now_ms);
                }
            }
            Either::Second(()) => {
                let now_ms = Instant::now().as_millis();
                if inverter_filter.accept(now_ms) {
                    if inverter_sense.is_high() {
                        SWITCH_CAPTURE.stamp_end(now_ms);
                    } else {
                        BACKUP_CAPTURE.stamp_end(now_ms);
                    }
                }
            }
        }
    }
}
