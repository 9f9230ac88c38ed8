//! Results output formatting (CSV).
//!
//! Column names come from the circuit engine, so these writers are only
//! meaningful on the rank that owns the circuit.

use crate::analysis::{OpResult, SweepResult, TranResult};
use crate::error::Result;
use std::io::Write;

/// Write operating point results as CSV.
///
/// Format:
/// ```csv
/// Variable,Value
/// V(in),5
/// V(a),3.3333333333333335
/// I(V1),-0.0016666666666666668
/// ```
pub fn write_op_csv<W: Write>(result: &OpResult, writer: &mut W) -> Result<()> {
    writeln!(writer, "Variable,Value")?;
    for (name, value) in result.node_names.iter().zip(&result.node_values).skip(1) {
        writeln!(writer, "{},{}", column(name), value)?;
    }
    Ok(())
}

/// Write DC sweep results as CSV, one row per accepted point.
///
/// Format:
/// ```csv
/// V1,V(in),V(a)
/// 0,0,0
/// 0.5,0.5,0.3333333333333333
/// ```
pub fn write_sweep_csv<W: Write>(result: &SweepResult, writer: &mut W) -> Result<()> {
    write!(writer, "{}", result.source)?;
    write_header(&result.node_names, writer)?;
    for (value, nodes) in result.values.iter().zip(&result.node_values) {
        write!(writer, "{}", value)?;
        write_row(nodes, writer)?;
    }
    Ok(())
}

/// Write transient results as CSV, one row per accepted time point.
///
/// Format:
/// ```csv
/// Time,V(in),V(a)
/// 0,0,0
/// 0.1,0.05,0.0012
/// ```
pub fn write_tran_csv<W: Write>(result: &TranResult, writer: &mut W) -> Result<()> {
    write!(writer, "Time")?;
    write_header(&result.node_names, writer)?;
    for (time, nodes) in result.times.iter().zip(&result.node_values) {
        write!(writer, "{}", time)?;
        write_row(nodes, writer)?;
    }
    Ok(())
}

/// `V(node)` for node voltages, `I(source)` for branch currents.
fn column(name: &str) -> String {
    match name.strip_suffix("#branch") {
        Some(source) => format!("I({})", source),
        None => format!("V({})", name),
    }
}

// Ground (node 0) is skipped in every table.
fn write_header<W: Write>(names: &[String], writer: &mut W) -> Result<()> {
    for name in names.iter().skip(1) {
        write!(writer, ",{}", column(name))?;
    }
    writeln!(writer)?;
    Ok(())
}

fn write_row<W: Write>(values: &[f64], writer: &mut W) -> Result<()> {
    for v in values.iter().skip(1) {
        write!(writer, ",{}", v)?;
    }
    writeln!(writer)?;
    Ok(())
}
