// SPDX-License-Identifier: Apache-2.0
//! Attribute value model: every value a scene exporter can push to a
//! worker plugin. Pure data; the wire encoding lives in [`crate::wire`].

use serde::{Deserialize, Serialize};

/// Row-major 4×4 affine transform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Transform(pub [[f32; 4]; 4]);

impl Transform {
    /// The identity transform.
    pub fn identity() -> Self {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self(m)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

/// One named mapping channel (UV or vertex-color data).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapChannel {
    /// Channel name as known to the host application.
    pub name: String,
    /// Per-vertex channel values.
    pub values: Vec<[f32; 3]>,
    /// Face index triples into `values`.
    pub faces: Vec<i32>,
}

/// Bundle of named mapping channels for one geometry plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MapChannels {
    /// Channels in host order.
    pub channels: Vec<MapChannel>,
}

/// One instanced copy inside an [`Instancer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceItem {
    /// Stable per-instance index.
    pub index: i32,
    /// World transform of this instance.
    pub transform: Transform,
    /// Name of the source plugin being instanced.
    pub node: String,
}

/// Time-stamped aggregate of per-instance transforms.
///
/// Carries its own frame number, distinct from the session frame; the
/// session rewrites it before sending when the two disagree (the embedded
/// value is a producer hint, the session clock is authoritative).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Instancer {
    /// Frame this aggregate was sampled at. Compared with `==`, never
    /// rounded: exact equality decides duplicate suppression.
    pub frame: f32,
    /// Instances in producer order.
    pub items: Vec<InstanceItem>,
}

/// Tagged union over every exportable scene value.
///
/// The tag determines which payload is valid; decode rejects unknown tags
/// outright rather than guessing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AttrValue {
    /// Placeholder for a value the exporter could not type.
    Unknown,
    /// Signed integer scalar.
    Int(i32),
    /// Float scalar.
    Float(f32),
    /// Text value.
    String(String),
    /// RGB color.
    Color([f32; 3]),
    /// 3D vector.
    Vector([f32; 3]),
    /// Affine transform.
    Transform(Transform),
    /// Reference to another plugin by name.
    Plugin(String),
    /// Ordered integer sequence.
    IntList(Vec<i32>),
    /// Ordered float sequence.
    FloatList(Vec<f32>),
    /// Ordered vector sequence.
    VectorList(Vec<[f32; 3]>),
    /// Ordered color sequence.
    ColorList(Vec<[f32; 3]>),
    /// Ordered string sequence.
    StringList(Vec<String>),
    /// Ordered plugin-reference sequence.
    PluginList(Vec<String>),
    /// Named UV/color channel bundle.
    MapChannels(MapChannels),
    /// Time-stamped per-instance transform aggregate.
    Instancer(Instancer),
}

/// Named, typed bundle of attribute values describing one exportable
/// scene entity. Produced by the scene-traversal layer, consumed exactly
/// once by the session's export call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginDesc {
    /// Plugin type identifier; an empty type is rejected at export time.
    pub type_id: String,
    /// Unique plugin instance name.
    pub name: String,
    /// Attribute name → value pairs; names unique within one desc.
    pub attrs: Vec<(String, AttrValue)>,
}

impl PluginDesc {
    /// Create an empty desc for the given type and instance name.
    pub fn new(type_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            name: name.into(),
            attrs: Vec::new(),
        }
    }

    /// Append an attribute. Names are expected unique; the last writer
    /// wins on the worker if a caller violates that.
    pub fn push(&mut self, attr: impl Into<String>, value: AttrValue) -> &mut Self {
        self.attrs.push((attr.into(), value));
        self
    }
}
