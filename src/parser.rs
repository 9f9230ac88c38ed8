//! Netlist parser.
//!
//! # Supported syntax
//!
//! ```text
//! * comment line
//! Rname n+ n- value
//! Cname n+ n- value
//! Vname n+ n- [DC val | val] [PULSE(..) | SIN(..) | PWL(..) | EXP(..)]
//! Iname n+ n- [DC val | val] [PULSE(..) | SIN(..) | PWL(..) | EXP(..)]
//! .ELECTRODE label node
//! .OP
//! .DC src start stop step
//! .TRAN tstep tstop [tstart] [UIC]
//! .END
//! ```
//!
//! Values support engineering suffixes: T, G, MEG, K, M, U, N, P, F
//! (case-insensitive). Node `GND` is an alias of ground `0`.

use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_until, take_while1};
use nom::character::complete::{char, space0, space1};
use nom::combinator::{map, opt};
use nom::number::complete::double;
use nom::sequence::delimited;
use nom::IResult;
use nom::Parser;

use crate::circuit::waveform::{Pulse, Waveform};
use crate::error::{MixError, Result};
use crate::ir::{Analysis, Component, ElectrodeLink, Netlist, SweepSource};

/// Parse a netlist string.
pub fn parse(input: &str) -> Result<Netlist> {
    let mut netlist = Netlist::default();

    for (line_num, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('*') {
            continue;
        }
        let upper = line.to_uppercase();
        if upper == ".END" {
            break;
        }

        let wrap = |e: String| parse_err(line_num, raw_line, &e);
        match upper.as_bytes()[0] {
            b'R' | b'C' => netlist.components.push(parse_passive_line(line).map_err(wrap)?),
            b'V' => netlist.components.push(parse_source_line(line, true).map_err(wrap)?),
            b'I' => netlist.components.push(parse_source_line(line, false).map_err(wrap)?),
            b'.' if upper.starts_with(".ELECTRODE") => {
                netlist.electrodes.push(parse_electrode_command(line).map_err(wrap)?)
            }
            b'.' => {
                if let Some(a) = parse_dot_command(line).map_err(wrap)? {
                    netlist.analyses.push(a);
                }
            }
            _ => {
                return Err(MixError::Parse(format!(
                    "line {}: unknown element: {}",
                    line_num + 1,
                    raw_line
                )));
            }
        }
    }

    Ok(netlist)
}

fn parse_err(line_num: usize, raw_line: &str, detail: &str) -> MixError {
    MixError::Parse(format!("line {}: {} in: {}", line_num + 1, detail, raw_line))
}

/// Parse a standalone waveform such as `PWL(0 0 1 1m)`.
pub fn parse_waveform(text: &str) -> Result<Waveform> {
    let (rest, w) = waveform(text.trim()).map_err(MixError::Parse)?;
    if !rest.trim().is_empty() {
        return Err(MixError::Parse(format!("trailing text after waveform: {rest}")));
    }
    Ok(w)
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Parse a numeric value with optional engineering suffix.
fn eng_value(input: &str) -> IResult<&str, f64> {
    let (rest, num) = double(input)?;
    let (rest, suffix) = opt(eng_suffix).parse(rest)?;
    Ok((rest, num * suffix.unwrap_or(1.0)))
}

fn eng_suffix(input: &str) -> IResult<&str, f64> {
    // MEG before M
    alt((
        map(tag_no_case("MEG"), |_: &str| 1e6),
        map(tag_no_case("T"), |_: &str| 1e12),
        map(tag_no_case("G"), |_: &str| 1e9),
        map(tag_no_case("K"), |_: &str| 1e3),
        map(tag_no_case("M"), |_: &str| 1e-3),
        map(tag_no_case("U"), |_: &str| 1e-6),
        map(tag_no_case("N"), |_: &str| 1e-9),
        map(tag_no_case("P"), |_: &str| 1e-12),
        map(tag_no_case("F"), |_: &str| 1e-15),
    ))
    .parse(input)
}

/// A whole token that must be a value, e.g. `4.7k`.
fn value_token(token: &str) -> std::result::Result<f64, String> {
    match eng_value(token) {
        Ok(("", v)) => Ok(v),
        _ => Err(format!("invalid value '{token}'")),
    }
}

fn node_id(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn element_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace())(input)
}

fn canonical_node(node: &str) -> String {
    if node.eq_ignore_ascii_case("gnd") {
        "0".to_string()
    } else {
        node.to_string()
    }
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

/// `Rname n+ n- value` or `Cname n+ n- value`
fn parse_passive_line(line: &str) -> std::result::Result<Component, String> {
    let (_, (name, _, n_plus, _, n_minus, _, value)) = (
        element_name,
        space1,
        node_id,
        space1,
        node_id,
        space1,
        eng_value,
    )
        .parse(line)
        .map_err(|_| "failed to parse two-terminal element".to_string())?;

    if !(value > 0.0) {
        return Err(format!("{name} must have a positive value"));
    }
    let name = name.to_string();
    let nodes = (canonical_node(n_plus), canonical_node(n_minus));
    if name.to_ascii_uppercase().starts_with('R') {
        Ok(Component::Resistor { name, nodes, value })
    } else {
        Ok(Component::Capacitor { name, nodes, value })
    }
}

/// `Vname n+ n- [DC val | val] [waveform]`
fn parse_source_line(line: &str, is_voltage: bool) -> std::result::Result<Component, String> {
    let (rest, (name, _, n_plus, _, n_minus, _)) =
        (element_name, space1, node_id, space1, node_id, space0)
            .parse(line)
            .map_err(|_| "failed to parse source name/nodes".to_string())?;

    let mut rest = rest.trim_start();
    let mut dc = None;
    if rest.len() >= 2 && rest[..2].eq_ignore_ascii_case("DC") {
        rest = rest[2..].trim_start();
        let (r, v) = eng_value(rest).map_err(|_| "failed to parse DC value".to_string())?;
        dc = Some(v);
        rest = r.trim_start();
    } else if let Ok((r, v)) = eng_value(rest) {
        dc = Some(v);
        rest = r.trim_start();
    }

    let waveform = if rest.is_empty() {
        None
    } else {
        let (r, w) = waveform(rest)?;
        if !r.trim().is_empty() {
            return Err(format!("unexpected trailing text '{}'", r.trim()));
        }
        Some(w)
    };

    let name = name.to_string();
    let nodes = (canonical_node(n_plus), canonical_node(n_minus));
    Ok(if is_voltage {
        Component::VSource { name, nodes, dc, waveform }
    } else {
        Component::ISource { name, nodes, dc, waveform }
    })
}

/// `KIND(arg arg ...)`, arguments separated by spaces or commas.
fn waveform(input: &str) -> std::result::Result<(&str, Waveform), String> {
    let (rest, (kind, _, body)) = (
        take_while1(|c: char| c.is_ascii_alphabetic()),
        space0,
        delimited(char('('), take_until(")"), char(')')),
    )
        .parse(input)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| format!("malformed waveform '{input}'"))?;

    let args = body
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .map(value_token)
        .collect::<std::result::Result<Vec<f64>, String>>()?;
    let arg = |i: usize, default: f64| args.get(i).copied().unwrap_or(default);

    let w = match kind.to_ascii_uppercase().as_str() {
        "PULSE" if args.len() >= 2 => Waveform::Pulse(Pulse {
            low: args[0],
            high: args[1],
            delay: arg(2, 0.0),
            rise: arg(3, 0.0),
            fall: arg(4, 0.0),
            width: arg(5, f64::INFINITY),
            period: arg(6, 0.0),
        }),
        "SIN" if args.len() >= 3 => Waveform::Sin {
            offset: args[0],
            amplitude: args[1],
            freq: args[2],
            delay: arg(3, 0.0),
            damping: arg(4, 0.0),
        },
        "PWL" if !args.is_empty() && args.len() % 2 == 0 => {
            let points: Vec<(f64, f64)> = args.chunks_exact(2).map(|p| (p[0], p[1])).collect();
            if points.windows(2).any(|w| w[1].0 < w[0].0) {
                return Err("PWL times must be non-decreasing".into());
            }
            Waveform::Pwl(points)
        }
        "EXP" if args.len() == 6 => Waveform::Exp {
            initial: args[0],
            pulsed: args[1],
            rise_delay: args[2],
            rise_tau: args[3],
            fall_delay: args[4],
            fall_tau: args[5],
        },
        other => return Err(format!("unsupported waveform {other} with {} arguments", args.len())),
    };
    Ok((rest, w))
}

// ---------------------------------------------------------------------------
// Dot commands
// ---------------------------------------------------------------------------

/// `.ELECTRODE label node`
fn parse_electrode_command(line: &str) -> std::result::Result<ElectrodeLink, String> {
    let (_, (_, _, label, _, node)) = (tag_no_case(".ELECTRODE"), space1, node_id, space1, node_id)
        .parse(line)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| "expected .ELECTRODE <label> <node>".to_string())?;
    Ok(ElectrodeLink {
        label: label.to_string(),
        node: canonical_node(node),
    })
}

/// Analysis commands; unrecognised dot commands are ignored.
fn parse_dot_command(line: &str) -> std::result::Result<Option<Analysis>, String> {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next().unwrap_or_default().to_uppercase();
    let args: Vec<&str> = tokens.collect();

    match keyword.as_str() {
        ".OP" => Ok(Some(Analysis::Op)),
        ".DC" => {
            let [src, start, stop, step] = args.as_slice() else {
                return Err(".DC expects <source> <start> <stop> <step>".into());
            };
            let step = value_token(step)?;
            if step == 0.0 {
                return Err(".DC step must be non-zero".into());
            }
            let source = match src.as_bytes().first().map(u8::to_ascii_uppercase) {
                Some(b'V') => SweepSource::Voltage(src.to_string()),
                Some(b'I') => SweepSource::Current(src.to_string()),
                _ => return Err(format!("cannot sweep '{src}': not an independent source")),
            };
            Ok(Some(Analysis::DcSweep {
                source,
                start: value_token(start)?,
                stop: value_token(stop)?,
                step,
            }))
        }
        ".TRAN" => {
            let uic = args.last().is_some_and(|a| a.eq_ignore_ascii_case("UIC"));
            let values = if uic { &args[..args.len() - 1] } else { &args[..] };
            let (tstep, tstop, tstart) = match values {
                [tstep, tstop] => (value_token(tstep)?, value_token(tstop)?, 0.0),
                [tstep, tstop, tstart] => (value_token(tstep)?, value_token(tstop)?, value_token(tstart)?),
                _ => return Err(".TRAN expects <tstep> <tstop> [<tstart>] [UIC]".into()),
            };
            if !(tstep > 0.0) || !(tstop > tstart) {
                return Err(".TRAN needs tstep > 0 and tstop > tstart".into());
            }
            Ok(Some(Analysis::Tran { tstep, tstop, tstart, uic }))
        }
        _ => Ok(None),
    }
}
