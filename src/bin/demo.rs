//! VFD Spindle Demo
//!
//! Runs a simulated Durapulse GS20 through a short spindle program on a
//! 10 ms control tick:
//! - select the spindle and start it clockwise
//! - ramp the speed with non-blocking updates
//! - reverse, then stop
//!
//! Usage: cargo run --bin demo

use std::time::Duration;

use tokio::time::interval;
use vfd_spindle::alarm::{Alarm, AlarmSink};
use vfd_spindle::sim::{ManualClock, SimTransport, SimulatedVfd};
use vfd_spindle::vfd::{Gs20, VfdSpindle};
use vfd_spindle::{
    AlarmChannel, DataRequest, ModbusConfig, ModbusEngine, SpindleRegistry, SpindleSettings,
    SpindleState,
};

struct ConsoleAlarms;

impl AlarmSink for ConsoleAlarms {
    fn raise(&mut self, alarm: Alarm) {
        println!("  ALARM: {:?}", alarm);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", vfd_spindle::info());
    println!("=====================================");

    let device = SimulatedVfd::new(1)
        .with_mirror(0x2001, 0x2103)
        .shared();
    let clock = ManualClock::new();
    let transport =
        SimTransport::new(clock.clone(), SimulatedVfd::responder(&device)).with_latency(3);
    let engine = ModbusEngine::new(transport, clock.clone(), ModbusConfig::default());

    let mut registry = SpindleRegistry::new(engine, AlarmChannel::new(Box::new(ConsoleAlarms)))
        .with_settings(SpindleSettings::default().with_at_speed_tolerance(5.0));
    let id = registry.register(VfdSpindle::new(Gs20::default()), "Durapulse GS20")?;
    registry.register_null()?;

    for line in registry.report_options(false) {
        println!("  {}", line);
    }

    registry.select(id)?;
    println!("  Delivered {} deferred alarms", registry.system_started());

    println!("\nStart CW at 3000 RPM");
    registry.set_state(SpindleState::cw(), 3000.0);

    let mut ticker = interval(Duration::from_millis(10));
    for tick in 0u32..120 {
        ticker.tick().await;
        clock.advance(10);
        registry.poll();

        match tick {
            30 => {
                println!("\nRamp to 6000 RPM");
                registry.update_rpm(6000.0);
            }
            60 => {
                println!("\nReverse at 6000 RPM");
                registry.set_state(SpindleState::ccw(), 6000.0);
            }
            100 => {
                println!("\nStop");
                registry.set_state(SpindleState::OFF, 0.0);
            }
            _ => {}
        }

        let state = registry.get_state();
        if tick % 10 == 0 {
            let data = registry.get_data(DataRequest::Rpm);
            println!(
                "  t={:>4} ms  on={} ccw={} at_speed={} rpm={:.0} programmed={:.0}",
                clock_ms(&clock),
                state.on,
                state.ccw,
                state.at_speed,
                data.rpm,
                data.rpm_programmed
            );
        }
    }

    let stats = registry.bus().stats();
    println!("\nBus statistics");
    println!("  requests sent:      {}", stats.requests_sent);
    println!("  responses received: {}", stats.responses_received);
    println!("  timeouts:           {}", stats.timeouts);
    println!("  success rate:       {:.1}%", stats.success_rate());
    println!("  register writes:    {:?}", device.borrow().writes());

    Ok(())
}

fn clock_ms(clock: &ManualClock) -> u64 {
    use vfd_spindle::Clock;
    clock.now_ms()
}
