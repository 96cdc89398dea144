/// Human readable text for a controller error code as returned by `PR ER`
pub fn describe_error(code: u32) -> String {
    let text = match code {
        0 => "no error",
        1 => "I/O 1 fault",
        2 => "I/O 2 fault",
        6 => "an I/O is already set to this type",
        8 => "tried to set an I/O to an incorrect I/O type",
        9 => "tried to write to I/O set as input",
        10 => "illegal I/O number",
        11 => "incorrect CLOCK type",
        20 => "tried to set unknown variable or flag",
        21 => "tried to set an incorrect value",
        22 => "VI set greater than or equal to VM",
        23 => "VM set less than or equal to VI",
        24 => "illegal data entered",
        25 => "variable or flag is read only",
        26 => "variable or flag is not allowed to be incremented",
        27 => "variable or flag cannot be read",
        28 => "variable or flag can only be read",
        30 => "unknown label or user variable",
        31 => "illegal label or user variable",
        40 => "illegal program address",
        41 => "program already exists",
        60 => "tried to enter unknown command",
        61 => "trying to set illegal baud rate",
        70 => "flash memory busy",
        71 => "flash checksum fault",
        80 => "home switch not defined",
        81 => "home type not defined",
        82 => "went to both limits and did not find home",
        83 => "reached positive limit switch",
        84 => "reached negative limit switch",
        85 => "MA or MR is not allowed during a move",
        86 => "locked rotor",
        87 => "torque too low",
        88 => "stall detected",
        89 => "MA or MR is not allowed while in hold",
        _ => return format!("unknown error code {}", code),
    };
    text.to_string()
}
