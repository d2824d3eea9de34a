//! Tricontinent C-Series Pump Controller
//!
//! Reference: C-Series OEM communication manual, Data Terminal (DT) protocol
//!
//! Protocol Overview:
//! - Format: `/` + [Address] + [Opcode][Operand]... + `R` + `\r` (ASCII)
//! - Reply: `/` + host address + status code + data + ETX
//! - Timing: Half-duplex request-response, every motion followed by an idle poll
//! - Valve state lives on the device and is re-queried before every switch
//!
//! # Example Usage
//!
//! ```no_run
//! use cseries_pump::adapters::SerialTransport;
//! use cseries_pump::config::PumpRegistry;
//! use cseries_pump::pump::PumpController;
//!
//! fn main() -> anyhow::Result<()> {
//!     let registry = PumpRegistry::load_from("cseries.toml")?;
//!     let config = registry.resolve("reagent")?;
//!     let transport = SerialTransport::from_config(&config);
//!     let mut pump = PumpController::new(config, Box::new(transport))?
//!         .with_idle_wait(registry.idle_wait());
//!
//!     pump.open()?;
//!     pump.configure()?;
//!     let report = pump.dispense(2.5)?;
//!     println!("{} full strokes", report.strokes_completed);
//!     pump.close()?;
//!     Ok(())
//! }
//! ```

use crate::adapters::Transport;
use crate::config::PumpConfig;
use crate::error::{DispenseStep, PumpError, PumpResult, StrokePhase};
use crate::idle::{self, CancelToken, IdleWait};
use crate::protocol::command::{self, Command, Opcode};
use crate::protocol::status::StatusResponse;
use crate::session::TransportSession;
use std::fmt;
use tracing::{info, warn};

/// Report code for the valve position query (`?6`).
const REPORT_VALVE_POSITION: u32 = 6;

/// Hydraulic port the syringe is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValvePosition {
    /// `I`
    Inlet,
    /// `O`
    Outlet,
    /// `B`
    Bypass,
    /// `E`
    Extra,
}

impl ValvePosition {
    /// Every position, in opcode order.
    pub const ALL: [ValvePosition; 4] = [
        ValvePosition::Inlet,
        ValvePosition::Outlet,
        ValvePosition::Bypass,
        ValvePosition::Extra,
    ];

    /// Valve-select opcode that moves the valve here.
    pub fn opcode(self) -> Opcode {
        match self {
            ValvePosition::Inlet => Opcode::ValveInlet,
            ValvePosition::Outlet => Opcode::ValveOutlet,
            ValvePosition::Bypass => Opcode::ValveBypass,
            ValvePosition::Extra => Opcode::ValveExtra,
        }
    }

    /// Decode the payload of a `?6` reply, ignoring case and padding.
    pub fn from_report(data: &str) -> Option<Self> {
        let data = data.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|pos| data.len() == 1 && data.starts_with(pos.opcode().as_char()))
    }
}

impl fmt::Display for ValvePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValvePosition::Inlet => "Inlet",
            ValvePosition::Outlet => "Outlet",
            ValvePosition::Bypass => "Bypass",
            ValvePosition::Extra => "Extra",
        };
        f.write_str(name)
    }
}

/// Outcome of [`PumpController::switch_valve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveSwitch {
    /// The device already reported the target; nothing was sent.
    AlreadyAt(ValvePosition),
    /// The select command was sent.
    Switched {
        /// Reported position before the switch
        from: ValvePosition,
        /// Requested position
        to: ValvePosition,
    },
}

impl ValveSwitch {
    /// Where the valve ends up.
    pub fn position(self) -> ValvePosition {
        match self {
            ValveSwitch::AlreadyAt(pos) => pos,
            ValveSwitch::Switched { to, .. } => to,
        }
    }
}

/// Initialization variants (`Z`, `Y`, `W`, `w`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitKind {
    /// Right valve port becomes the output
    ValveRight,
    /// Left valve port becomes the output
    ValveLeft,
    /// Plunger only, for valveless pumps
    NoValve,
    /// Valve drive only, the plunger stays put
    ValveOnly,
}

impl InitKind {
    /// Command letter for this variant.
    pub fn opcode(self) -> Opcode {
        match self {
            InitKind::ValveRight => Opcode::InitializeValveRight,
            InitKind::ValveLeft => Opcode::InitializeValveLeft,
            InitKind::NoValve => Opcode::InitializeNoValve,
            InitKind::ValveOnly => Opcode::InitializeValveOnly,
        }
    }
}

/// Stroke decomposition of a dispense request.
///
/// `partial_volume_ml` is `remainder * syringe_volume`. The product grows
/// with the square of the syringe size, so any remainder above 1 mL asks
/// for more than a full syringe and the partial aspirate fails with
/// `OutOfRange` once the full strokes are delivered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispensePlan {
    /// Volume asked for, in mL
    pub requested_ml: f64,
    /// Whole syringes delivered before the partial stroke
    pub full_strokes: u32,
    /// `requested_ml` modulo the syringe volume
    pub remainder_ml: f64,
    /// Aspirate target of the partial stroke
    pub partial_volume_ml: f64,
}

impl DispensePlan {
    /// # Errors
    ///
    /// `InvalidVolume` unless `ml` is positive and finite, or when it needs
    /// more full strokes than a `u32` counts.
    pub fn new(ml: f64, syringe_volume_ml: f64) -> PumpResult<Self> {
        if !(ml.is_finite() && ml > 0.0) {
            return Err(PumpError::InvalidVolume(ml));
        }
        let strokes = (ml / syringe_volume_ml).floor();
        if !(0.0..=f64::from(u32::MAX)).contains(&strokes) {
            return Err(PumpError::InvalidVolume(ml));
        }
        let remainder_ml = ml % syringe_volume_ml;
        Ok(Self {
            requested_ml: ml,
            full_strokes: strokes as u32,
            remainder_ml,
            partial_volume_ml: remainder_ml * syringe_volume_ml,
        })
    }
}

/// Result of a completed dispense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispenseReport {
    /// Decomposition that was executed
    pub plan: DispensePlan,
    /// Full strokes delivered, the partial stroke not counted
    pub strokes_completed: u32,
}

const PRIME_PHASES: [StrokePhase; 2] = [StrokePhase::SelectInlet, StrokePhase::Dispense];
const STROKE_PHASES: [StrokePhase; 4] = [
    StrokePhase::SelectInlet,
    StrokePhase::Aspirate,
    StrokePhase::SelectOutlet,
    StrokePhase::Dispense,
];

/// Driver for one C-Series pump.
///
/// Owns its transport session exclusively. Every operation blocks until the
/// device round-trip (and any idle wait it sequences) completes.
pub struct PumpController {
    config: PumpConfig,
    session: TransportSession,
    idle_wait: IdleWait,
}

impl PumpController {
    /// Create a controller for `config` over `transport`.
    ///
    /// The transport is not opened until [`open`](Self::open).
    ///
    /// # Errors
    /// Returns `ConfigInvalid` if the configuration fails validation
    pub fn new(config: PumpConfig, transport: Box<dyn Transport>) -> PumpResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            session: TransportSession::new(transport),
            idle_wait: IdleWait::default(),
        })
    }

    /// Replace the idle-wait cadence and bounds.
    pub fn with_idle_wait(mut self, idle_wait: IdleWait) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Settings this controller was built with.
    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Open the transport session.
    pub fn open(&mut self) -> PumpResult<()> {
        self.session.open()
    }

    /// Close the session. Safe to call more than once.
    pub fn close(&mut self) -> PumpResult<()> {
        self.session.close()
    }

    /// Send one command and fail on an unhealthy reply.
    fn send(&mut self, command: &Command) -> PumpResult<StatusResponse> {
        self.session
            .request(self.config.address, command)?
            .check(command.opcode().as_char())
    }

    /// Block until the pump reports idle, within the configured bounds.
    pub fn wait_for_idle(&mut self) -> PumpResult<()> {
        self.settle(None)
    }

    fn settle(&mut self, cancel: Option<&CancelToken>) -> PumpResult<()> {
        idle::wait_for_idle(&mut self.session, self.config.address, &self.idle_wait, cancel)
    }

    /// [`wait_for_idle`](Self::wait_for_idle), also returning `Cancelled` once
    /// `cancel` fires.
    pub fn wait_for_idle_cancellable(&mut self, cancel: &CancelToken) -> PumpResult<()> {
        self.settle(Some(cancel))
    }

    /// Query status (`Q`). The reply is returned as classified, healthy or not.
    pub fn status(&mut self) -> PumpResult<StatusResponse> {
        self.session
            .request(self.config.address, &Command::status_query())
    }

    /// Upload increment mode, acceleration, velocities and cutoff increment,
    /// waiting for idle after each.
    pub fn configure(&mut self) -> PumpResult<()> {
        let settings = [
            Command::with_operand(Opcode::IncrementMode, self.config.increment_mode.code()),
            Command::with_operand(Opcode::AccelerationSlope, self.config.acceleration_slope),
            Command::with_operand(Opcode::StartVelocity, self.config.start_velocity),
            Command::with_operand(Opcode::TopVelocity, self.config.top_velocity),
            Command::with_operand(Opcode::CutoffVelocity, self.config.cutoff_velocity),
            Command::with_operand(Opcode::CutoffIncrement, self.config.cutoff_increment),
        ];
        for command in &settings {
            self.send(command)?;
            self.wait_for_idle()?;
        }
        info!(
            "Configured pump '{}' ({:?}, max {} steps)",
            self.config.name,
            self.config.increment_mode,
            self.config.max_steps()
        );
        Ok(())
    }

    /// Initialize plunger and valve drive, then wait for idle.
    pub fn initialize(&mut self, kind: InitKind) -> PumpResult<()> {
        self.send(&Command::new(kind.opcode()))?;
        self.wait_for_idle()?;
        info!("Initialized pump '{}' ({:?})", self.config.name, kind);
        Ok(())
    }

    /// Plunger step position for an absolute volume.
    ///
    /// # Errors
    /// `OutOfRange` when the rounded step count falls outside `0..=max_steps`
    pub fn steps_for_volume(&self, ml: f64) -> PumpResult<u32> {
        let max_steps = self.config.max_steps();
        let steps = (f64::from(max_steps) / self.config.syringe_volume_ml * ml).round();
        if steps.is_finite() && (0.0..=f64::from(max_steps)).contains(&steps) {
            Ok(steps as u32)
        } else {
            Err(PumpError::OutOfRange {
                volume_ml: ml,
                steps,
                max_steps,
            })
        }
    }

    /// Move the plunger to the position holding `ml` millilitres.
    ///
    /// Does not wait for the move to finish.
    ///
    /// # Errors
    /// `OutOfRange` before anything is written
    pub fn move_to_absolute_volume(&mut self, ml: f64) -> PumpResult<u32> {
        let steps = self.steps_for_volume(ml).map_err(|e| {
            warn!("Pump '{}': {}", self.config.name, e);
            e
        })?;
        self.send(&Command::move_to(steps))?;
        Ok(steps)
    }

    /// Current valve position as reported by the device (`?6`).
    pub fn valve_position(&mut self) -> PumpResult<ValvePosition> {
        let reply = self.send(&Command::report(REPORT_VALVE_POSITION))?;
        ValvePosition::from_report(&reply.data).ok_or(PumpError::UnexpectedReply {
            opcode: Opcode::Report.as_char(),
            data: reply.data,
        })
    }

    /// Move the valve to `target` unless the device already reports it there.
    ///
    /// Waits for idle around the position query. Does not wait after the
    /// valve-select command.
    pub fn switch_valve(&mut self, target: ValvePosition) -> PumpResult<ValveSwitch> {
        self.switch_valve_inner(target, None)
    }

    fn switch_valve_inner(
        &mut self,
        target: ValvePosition,
        cancel: Option<&CancelToken>,
    ) -> PumpResult<ValveSwitch> {
        self.settle(cancel)?;
        let current = self.valve_position()?;
        self.settle(cancel)?;

        if current == target {
            info!(
                "Pump '{}': valve already at {}, no change made",
                self.config.name, target
            );
            return Ok(ValveSwitch::AlreadyAt(target));
        }
        self.send(&Command::new(target.opcode()))?;
        info!(
            "Pump '{}': valve moved {} -> {}",
            self.config.name, current, target
        );
        Ok(ValveSwitch::Switched {
            from: current,
            to: target,
        })
    }

    /// Send a hand-typed command such as `A1200` or `?6`.
    ///
    /// The first character is the opcode and the rest its operand. The reply
    /// is returned unchecked.
    pub fn send_raw(&mut self, text: &str) -> PumpResult<StatusResponse> {
        let text = text.trim();
        let mut chars = text.chars();
        let opcode = chars
            .next()
            .ok_or_else(|| PumpError::InvalidCommand(text.to_string()))?;
        let operand = chars.as_str();
        let frame = command::encode(self.config.address, opcode, Some(operand));
        let reply = self.session.exchange(&frame)?;
        StatusResponse::parse(&reply)
    }

    /// Send several commands in one frame, then wait for idle.
    pub fn run_program(&mut self, steps: &[(char, String)]) -> PumpResult<StatusResponse> {
        let opcodes: Vec<char> = steps.iter().map(|(op, _)| *op).collect();
        let operands: Vec<&str> = steps.iter().map(|(_, operand)| operand.as_str()).collect();
        let frame = command::encode_multi(self.config.address, &opcodes, &operands);
        let reply = self.session.exchange(&frame)?;
        let opcode = opcodes.first().copied().unwrap_or(Opcode::Execute.as_char());
        let status = StatusResponse::parse(&reply)?.check(opcode)?;
        self.wait_for_idle()?;
        Ok(status)
    }

    /// Abort the running command or program (`T`).
    pub fn terminate(&mut self) -> PumpResult<StatusResponse> {
        self.send(&Command::new(Opcode::Terminate))
    }

    /// Dispense `ml` from inlet to outlet.
    ///
    /// Primes (empties the syringe through the inlet), runs every full
    /// stroke, then the partial stroke. Every valve switch and plunger move
    /// is followed by an idle wait. Not transactional: strokes already
    /// delivered stay delivered.
    ///
    /// # Errors
    /// `InvalidVolume` for a non-positive request; any other failure is
    /// wrapped in `Dispense` with the step reached and full strokes completed
    pub fn dispense(&mut self, ml: f64) -> PumpResult<DispenseReport> {
        self.dispense_inner(ml, None)
    }

    /// [`dispense`](Self::dispense) that stops once `cancel` fires.
    ///
    /// The token is checked before every valve switch and plunger move and
    /// at every idle poll, so no new command goes out after cancellation,
    /// even while the pump never reports idle. A motion already running on
    /// the device is not aborted; send [`terminate`](Self::terminate) for that.
    /// The error carries the phase the dispense stopped in.
    pub fn dispense_with_cancel(
        &mut self,
        ml: f64,
        cancel: &CancelToken,
    ) -> PumpResult<DispenseReport> {
        self.dispense_inner(ml, Some(cancel))
    }

    fn dispense_inner(
        &mut self,
        ml: f64,
        cancel: Option<&CancelToken>,
    ) -> PumpResult<DispenseReport> {
        let plan = DispensePlan::new(ml, self.config.syringe_volume_ml)?;
        info!(
            "Pump '{}': dispensing {} mL ({} full strokes, partial {} mL)",
            self.config.name, ml, plan.full_strokes, plan.partial_volume_ml
        );

        self.run_stroke(&PRIME_PHASES, 0.0, DispenseStep::Prime, 0, cancel)?;

        let syringe = self.config.syringe_volume_ml;
        for index in 0..plan.full_strokes {
            let step = |phase| DispenseStep::FullStroke { index, phase };
            self.run_stroke(&STROKE_PHASES, syringe, step, index, cancel)?;
        }

        self.run_stroke(
            &STROKE_PHASES,
            plan.partial_volume_ml,
            DispenseStep::PartialStroke,
            plan.full_strokes,
            cancel,
        )?;

        info!("Pump '{}': finished dispensing {} mL", self.config.name, ml);
        Ok(DispenseReport {
            plan,
            strokes_completed: plan.full_strokes,
        })
    }

    /// Run the phases of one stroke, tagging failures with where they happened.
    fn run_stroke(
        &mut self,
        phases: &[StrokePhase],
        fill_ml: f64,
        step: impl Fn(StrokePhase) -> DispenseStep,
        strokes_completed: u32,
        cancel: Option<&CancelToken>,
    ) -> PumpResult<()> {
        let fail = |phase: StrokePhase, source: PumpError| PumpError::Dispense {
            step: step(phase),
            strokes_completed,
            source: Box::new(source),
        };

        for &phase in phases {
            if let Err(source) = self.run_phase(phase, fill_ml, cancel) {
                if matches!(source, PumpError::Cancelled) {
                    warn!(
                        "Pump '{}': dispense cancelled during {}",
                        self.config.name,
                        step(phase)
                    );
                }
                return Err(fail(phase, source));
            }
        }
        Ok(())
    }

    fn run_phase(
        &mut self,
        phase: StrokePhase,
        fill_ml: f64,
        cancel: Option<&CancelToken>,
    ) -> PumpResult<()> {
        if let Some(token) = cancel {
            token.check()?;
        }
        match phase {
            StrokePhase::SelectInlet => {
                self.switch_valve_inner(ValvePosition::Inlet, cancel)?;
            }
            StrokePhase::SelectOutlet => {
                self.switch_valve_inner(ValvePosition::Outlet, cancel)?;
            }
            StrokePhase::Aspirate => {
                self.move_to_absolute_volume(fill_ml)?;
            }
            StrokePhase::Dispense => {
                self.move_to_absolute_volume(0.0)?;
            }
        }
        self.settle(cancel)
    }
}
