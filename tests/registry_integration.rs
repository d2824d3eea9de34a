//! Configuration file to running controller: load a registry from disk,
//! resolve a pump and drive it against the simulated device.

use cseries_pump::adapters::SimulatedPump;
use cseries_pump::{InitKind, PumpController, PumpError, PumpRegistry, ValvePosition, ValveSwitch};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Creates a temporary configuration file with two pumps.
fn create_temp_config_file() -> NamedTempFile {
    let content = r#"
[idle_wait]
poll_interval_ms = 1
timeout_ms = 5000

[[pumps]]
name = "reagent"
syringe_volume_ml = 2.5
increment_mode = 1
stroke_steps = 3000
address = "3"
port = "/dev/ttyUSB0"
acceleration_slope = 20
top_velocity = 4000

[[pumps]]
name = "buffer"
syringe_volume_ml = 25.0
stroke_steps = 24000
address = "4"
port = "/dev/ttyUSB1"
"#;
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn connect(registry: &PumpRegistry, name: &str) -> (PumpController, SimulatedPump) {
    let config = registry.resolve(name).unwrap();
    let sim = SimulatedPump::new(config.address, config.max_steps());
    let mut pump = PumpController::new(config, Box::new(sim.clone()))
        .unwrap()
        .with_idle_wait(registry.idle_wait());
    pump.open().unwrap();
    (pump, sim)
}

#[test]
fn test_registry_drives_configure() {
    let file = create_temp_config_file();
    let registry = PumpRegistry::load_from(file.path()).unwrap();
    assert_eq!(registry.idle_wait().poll_interval, Duration::from_millis(1));

    let (mut pump, sim) = connect(&registry, "reagent");
    assert_eq!(pump.config().max_steps(), 24000);

    pump.configure().unwrap();
    assert_eq!(
        sim.commands(),
        vec!["N1", "L20", "v900", "V4000", "c900", "C0"]
    );
}

#[test]
fn test_frames_carry_configured_address() {
    let file = create_temp_config_file();
    let registry = PumpRegistry::load_from(file.path()).unwrap();
    let (mut pump, sim) = connect(&registry, "buffer");

    // 24000 steps over 25 mL
    assert_eq!(pump.move_to_absolute_volume(12.5).unwrap(), 12000);
    pump.wait_for_idle().unwrap();
    assert_eq!(sim.plunger(), 12000);
}

#[test]
fn test_initialize_then_switch_valve() {
    let file = create_temp_config_file();
    let registry = PumpRegistry::load_from(file.path()).unwrap();
    let config = registry.resolve("reagent").unwrap();
    let sim = SimulatedPump::new(config.address, config.max_steps()).uninitialized();
    let mut pump = PumpController::new(config, Box::new(sim.clone()))
        .unwrap()
        .with_idle_wait(registry.idle_wait());
    pump.open().unwrap();

    pump.initialize(InitKind::ValveLeft).unwrap();
    assert_eq!(pump.valve_position().unwrap(), ValvePosition::Inlet);
    assert_eq!(
        pump.switch_valve(ValvePosition::Extra).unwrap(),
        ValveSwitch::Switched {
            from: ValvePosition::Inlet,
            to: ValvePosition::Extra
        }
    );
    assert_eq!(
        pump.switch_valve(ValvePosition::Extra).unwrap(),
        ValveSwitch::AlreadyAt(ValvePosition::Extra)
    );
    assert_eq!(sim.commands(), vec!["Y", "?6", "?6", "E", "?6"]);
}

#[test]
fn test_unknown_pump_name() {
    let file = create_temp_config_file();
    let registry = PumpRegistry::load_from(file.path()).unwrap();
    assert!(matches!(
        registry.resolve("waste"),
        Err(PumpError::PumpNotFound(_))
    ));
}
