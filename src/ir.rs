//! Netlist intermediate representation.
//!
//! The parser produces a `Netlist`; the circuit engine is built from its
//! components and electrode links, and the driver runs its analyses.

use crate::circuit::waveform::Waveform;

/// Node identifier in the netlist. Ground is always `"0"`.
pub type NodeId = String;

/// A circuit component parsed from the netlist.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Resistor {
        name: String,
        nodes: (NodeId, NodeId),
        value: f64,
    },
    Capacitor {
        name: String,
        nodes: (NodeId, NodeId),
        value: f64,
    },
    VSource {
        name: String,
        nodes: (NodeId, NodeId),
        dc: Option<f64>,
        waveform: Option<Waveform>,
    },
    ISource {
        name: String,
        nodes: (NodeId, NodeId),
        dc: Option<f64>,
        waveform: Option<Waveform>,
    },
}

/// `.ELECTRODE <label> <node>`: ties a device boundary to a circuit node.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeLink {
    pub label: String,
    pub node: NodeId,
}

/// Independent source driven by a DC sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepSource {
    Voltage(String),
    Current(String),
}

impl SweepSource {
    pub fn name(&self) -> &str {
        match self {
            SweepSource::Voltage(n) | SweepSource::Current(n) => n,
        }
    }
}

/// An analysis command from the netlist.
#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    /// `.OP`
    Op,
    /// `.DC <src> <start> <stop> <step>`
    DcSweep {
        source: SweepSource,
        start: f64,
        stop: f64,
        step: f64,
    },
    /// `.TRAN <tstep> <tstop> [<tstart>] [UIC]`
    Tran {
        tstep: f64,
        tstop: f64,
        tstart: f64,
        uic: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Netlist {
    pub components: Vec<Component>,
    pub electrodes: Vec<ElectrodeLink>,
    pub analyses: Vec<Analysis>,
}
