//! Command frame codec for the Data Terminal protocol.
//!
//! Frame format: `/` + address + opcode + operand digits + `R` + `\r`.
//! A multi-command frame concatenates several opcode/operand pairs between
//! the address and the execute marker. The codec performs no validation of
//! opcode legality; `Command` is the typed way to build frames.

use std::fmt;

/// Start-of-frame marker.
pub const START_MARKER: char = '/';
/// Execute marker appended to every command string.
pub const EXECUTE_MARKER: char = 'R';
/// Frame terminator.
pub const TERMINATOR: char = '\r';

/// Opcodes used to drive a syringe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `R`, run the preceding commands
    Execute,
    /// `Z`, home plunger and valve, output on the right
    InitializeValveRight,
    /// `Y`, home plunger and valve, output on the left
    InitializeValveLeft,
    /// `W`, home the plunger only
    InitializeNoValve,
    /// `w`, home the valve only
    InitializeValveOnly,
    /// `N`, standard or microstep resolution
    IncrementMode,
    /// `A`, absolute plunger position in steps
    MoveTo,
    /// `P`, relative aspirate
    Pickup,
    /// `D`, relative dispense
    Deliver,
    /// `L`
    AccelerationSlope,
    /// `v`
    StartVelocity,
    /// `V`
    TopVelocity,
    /// `c`
    CutoffVelocity,
    /// `C`
    CutoffIncrement,
    /// `I`
    ValveInlet,
    /// `O`
    ValveOutlet,
    /// `B`
    ValveBypass,
    /// `E`
    ValveExtra,
    /// `g`, start of a repeated block
    LoopStart,
    /// `G`, repeat count for the block
    LoopRepeat,
    /// `U`, write a configuration word to EEPROM
    EepromConfig,
    /// `u`, low-level EEPROM configuration
    EepromLowLevelConfig,
    /// `T`, abort the running command
    Terminate,
    /// `Q`, status poll
    ReportStatus,
    /// `?`, report query
    Report,
}

impl Opcode {
    /// Every opcode in the enumeration.
    pub const ALL: [Opcode; 25] = [
        Opcode::Execute,
        Opcode::InitializeValveRight,
        Opcode::InitializeValveLeft,
        Opcode::InitializeNoValve,
        Opcode::InitializeValveOnly,
        Opcode::IncrementMode,
        Opcode::MoveTo,
        Opcode::Pickup,
        Opcode::Deliver,
        Opcode::AccelerationSlope,
        Opcode::StartVelocity,
        Opcode::TopVelocity,
        Opcode::CutoffVelocity,
        Opcode::CutoffIncrement,
        Opcode::ValveInlet,
        Opcode::ValveOutlet,
        Opcode::ValveBypass,
        Opcode::ValveExtra,
        Opcode::LoopStart,
        Opcode::LoopRepeat,
        Opcode::EepromConfig,
        Opcode::EepromLowLevelConfig,
        Opcode::Terminate,
        Opcode::ReportStatus,
        Opcode::Report,
    ];

    /// Wire character for this opcode.
    pub const fn as_char(self) -> char {
        match self {
            Opcode::Execute => 'R',
            Opcode::InitializeValveRight => 'Z',
            Opcode::InitializeValveLeft => 'Y',
            Opcode::InitializeNoValve => 'W',
            Opcode::InitializeValveOnly => 'w',
            Opcode::IncrementMode => 'N',
            Opcode::MoveTo => 'A',
            // 'P' is relative pickup (aspirate N steps)
            Opcode::Pickup => 'P',
            Opcode::Deliver => 'D',
            Opcode::AccelerationSlope => 'L',
            Opcode::StartVelocity => 'v',
            Opcode::TopVelocity => 'V',
            Opcode::CutoffVelocity => 'c',
            Opcode::CutoffIncrement => 'C',
            Opcode::ValveInlet => 'I',
            Opcode::ValveOutlet => 'O',
            Opcode::ValveBypass => 'B',
            Opcode::ValveExtra => 'E',
            Opcode::LoopStart => 'g',
            Opcode::LoopRepeat => 'G',
            Opcode::EepromConfig => 'U',
            Opcode::EepromLowLevelConfig => 'u',
            Opcode::Terminate => 'T',
            Opcode::ReportStatus => 'Q',
            Opcode::Report => '?',
        }
    }

    /// Look up an opcode by its wire character.
    pub fn from_char(c: char) -> Option<Opcode> {
        Self::ALL.iter().copied().find(|op| op.as_char() == c)
    }
}

impl From<Opcode> for char {
    fn from(op: Opcode) -> char {
        op.as_char()
    }
}

/// Encode a single command frame.
///
/// An absent or empty operand is omitted entirely.
pub fn encode(address: char, opcode: char, operand: Option<&str>) -> Vec<u8> {
    let operand = operand.unwrap_or("");
    let mut frame = String::with_capacity(5 + operand.len());
    frame.push(START_MARKER);
    frame.push(address);
    frame.push(opcode);
    frame.push_str(operand);
    frame.push(EXECUTE_MARKER);
    frame.push(TERMINATOR);
    frame.into_bytes()
}

/// Encode a multi-command frame, pairing opcodes and operands by position.
///
/// Missing entries on either side are treated as empty strings, so a short
/// operand list never fails.
pub fn encode_multi<S: AsRef<str>>(address: char, opcodes: &[char], operands: &[S]) -> Vec<u8> {
    let mut frame = String::new();
    frame.push(START_MARKER);
    frame.push(address);
    for i in 0..opcodes.len().max(operands.len()) {
        if let Some(op) = opcodes.get(i) {
            frame.push(*op);
        }
        if let Some(operand) = operands.get(i) {
            frame.push_str(operand.as_ref());
        }
    }
    frame.push(EXECUTE_MARKER);
    frame.push(TERMINATOR);
    frame.into_bytes()
}

/// A typed command: opcode plus optional decimal operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: Opcode,
    operand: Option<String>,
}

impl Command {
    /// Command without operand.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand: None,
        }
    }

    /// Command with a numeric operand.
    pub fn with_operand(opcode: Opcode, operand: impl fmt::Display) -> Self {
        Self {
            opcode,
            operand: Some(operand.to_string()),
        }
    }

    /// Absolute plunger move `A<steps>`.
    pub fn move_to(steps: u32) -> Self {
        Self::with_operand(Opcode::MoveTo, steps)
    }

    /// Status query `Q`.
    pub fn status_query() -> Self {
        Self::new(Opcode::ReportStatus)
    }

    /// Report query `?<code>`.
    pub fn report(code: u32) -> Self {
        Self::with_operand(Opcode::Report, code)
    }

    /// Opcode of this command.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Operand digits, if any.
    pub fn operand(&self) -> Option<&str> {
        self.operand.as_deref()
    }

    /// Wire bytes for this command addressed to `address`.
    pub fn encode(&self, address: char) -> Vec<u8> {
        encode(address, self.opcode.as_char(), self.operand.as_deref())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.opcode.as_char(), self.operand.as_deref().unwrap_or(""))
    }
}

/// A command frame decoded back from wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Pump address the frame was sent to
    pub address: char,
    /// Everything between the address and the execute marker.
    pub body: String,
}

impl DecodedFrame {
    /// Split the body into opcode/operand pairs.
    ///
    /// Every non-digit character starts a new command; the digits that follow
    /// it form its operand.
    pub fn commands(&self) -> Vec<(char, String)> {
        let mut commands: Vec<(char, String)> = Vec::new();
        for c in self.body.chars() {
            match commands.last_mut() {
                Some((_, operand)) if c.is_ascii_digit() => operand.push(c),
                _ => commands.push((c, String::new())),
            }
        }
        commands
    }

    /// Opcode of the first command in the frame.
    pub fn opcode(&self) -> Option<char> {
        self.body.chars().next()
    }

    /// Operand of the first command in the frame.
    pub fn operand(&self) -> String {
        self.commands()
            .into_iter()
            .next()
            .map(|(_, operand)| operand)
            .unwrap_or_default()
    }
}

/// Decode a command frame produced by [`encode`] or [`encode_multi`].
pub fn decode(bytes: &[u8]) -> Option<DecodedFrame> {
    let text = std::str::from_utf8(bytes).ok()?;
    let text = text.strip_suffix(TERMINATOR)?;
    let text = text.strip_prefix(START_MARKER)?;
    let text = text.strip_suffix(EXECUTE_MARKER)?;
    let mut chars = text.chars();
    let address = chars.next()?;
    Some(DecodedFrame {
        address,
        body: chars.as_str().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_with_operand() {
        assert_eq!(encode('1', 'A', Some("3000")), b"/1A3000R\r".to_vec());
    }

    #[test]
    fn test_encode_without_operand() {
        assert_eq!(encode('1', 'Z', None), b"/1ZR\r".to_vec());
        assert_eq!(encode('1', 'Z', Some("")), b"/1ZR\r".to_vec());
    }

    #[test]
    fn test_status_query_frame() {
        assert_eq!(Command::status_query().encode('3'), b"/3QR\r".to_vec());
        assert_eq!(Command::report(6).encode('3'), b"/3?6R\r".to_vec());
    }

    #[test]
    fn test_encode_multi_short_operands() {
        let frame = encode_multi('1', &['g', 'I', 'A', 'O', 'A', 'G'], &["", "", "3000", "", "0", "25"]);
        assert_eq!(frame, b"/1gIA3000OA0G25R\r".to_vec());

        let frame = encode_multi('1', &['I', 'A', 'O'], &["", "1200"]);
        assert_eq!(frame, b"/1IA1200OR\r".to_vec());
    }

    #[test]
    fn test_decode_round_trip() {
        let frame = decode(&encode('0', 'A', Some("3000"))).unwrap();
        assert_eq!(frame.address, '0');
        assert_eq!(frame.opcode(), Some('A'));
        assert_eq!(frame.operand(), "3000");
    }

    #[test]
    fn test_decode_multi_commands() {
        let frame = decode(b"/1gIA3000OA0G25R\r").unwrap();
        assert_eq!(
            frame.commands(),
            vec![
                ('g', String::new()),
                ('I', String::new()),
                ('A', "3000".to_string()),
                ('O', String::new()),
                ('A', "0".to_string()),
                ('G', "25".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"1A3000R\r").is_none());
        assert!(decode(b"/1A3000\r").is_none());
        assert!(decode(b"/R\r").is_none());
    }

    #[test]
    fn test_opcode_chars_are_unique() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_char(op.as_char()), Some(op));
        }
    }
}
