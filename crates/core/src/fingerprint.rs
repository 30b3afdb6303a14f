use std::fmt;

use crate::params::ParamGroups;

/// CAD assemblies that can be visualized. Bounded set; the path segment is
/// matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assembly {
    /// The full wind turbine.
    WindTurbine,
    /// Stator casting mold.
    StatorMold,
    /// Rotor casting mold.
    RotorMold,
    /// Magnet placement jig.
    MagnetJig,
    /// Coil winding jig.
    CoilWinder,
}

impl Assembly {
    /// Parse a URL path segment. `None` for anything outside the set.
    pub fn parse(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "windturbine" | "wind_turbine" => Some(Assembly::WindTurbine),
            "statormold" | "stator_mold" => Some(Assembly::StatorMold),
            "rotormold" | "rotor_mold" => Some(Assembly::RotorMold),
            "magnetjig" | "magnet_jig" => Some(Assembly::MagnetJig),
            "coilwinder" | "coil_winder" => Some(Assembly::CoilWinder),
            _ => None,
        }
    }

    /// Canonical assembly name, as used in fingerprints and handed to the
    /// build driver.
    pub fn as_str(&self) -> &'static str {
        match self {
            Assembly::WindTurbine => "WindTurbine",
            Assembly::StatorMold => "StatorMold",
            Assembly::RotorMold => "RotorMold",
            Assembly::MagnetJig => "MagnetJig",
            Assembly::CoilWinder => "CoilWinder",
        }
    }
}

/// One of the three build operations exposed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildTarget {
    /// Build the model and export the given assembly for the 3D viewer.
    Visualize(Assembly),
    /// Build the CNC cut overview.
    CncOverview,
    /// Build the dimension tables.
    DimensionTables,
}

impl BuildTarget {
    /// Operation name as used on the wire and in logs.
    pub fn operation(&self) -> &'static str {
        match self {
            BuildTarget::Visualize(_) => "visualize",
            BuildTarget::CncOverview => "cncOverview",
            BuildTarget::DimensionTables => "dimensionTables",
        }
    }

    /// The assembly, for `visualize` targets.
    pub fn assembly(&self) -> Option<Assembly> {
        match self {
            BuildTarget::Visualize(assembly) => Some(*assembly),
            _ => None,
        }
    }

    fn to_json(self) -> serde_json::Value {
        match self {
            BuildTarget::Visualize(assembly) => {
                serde_json::json!({ "operation": "visualize", "assembly": assembly.as_str() })
            }
            BuildTarget::CncOverview => serde_json::json!({ "operation": "cncOverview" }),
            BuildTarget::DimensionTables => serde_json::json!({ "operation": "dimensionTables" }),
        }
    }
}

/// A fully canonicalized build request: the operation plus its grouped,
/// coerced parameters. This is the fingerprint input.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    /// Requested operation.
    pub target: BuildTarget,
    /// Canonicalized parameters.
    pub params: ParamGroups,
}

impl BuildRequest {
    /// Canonical JSON of the whole request. Key order is stable: the outer
    /// map and everything below it are built from ordered maps.
    pub fn canonical_json(&self) -> serde_json::Value {
        serde_json::json!({
            "params": self.params.canonical_json(),
            "target": self.target.to_json(),
        })
    }

    /// Digest of the canonical form.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.canonical_json())
    }
}

/// Stable digest of a canonical build request.
///
/// Equal canonical forms produce equal fingerprints by construction; the
/// digest exists so keys are cheap to compare, hash, and log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    fn of(canonical: &serde_json::Value) -> Self {
        let digest = md5::compute(canonical.to_string().as_bytes());
        Fingerprint(format!("{digest:x}"))
    }

    /// Hex digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
