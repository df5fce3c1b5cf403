//! Convenience operations expressed as script templates.
//!
//! Every entry is data: a parameter list and a Rhai template with
//! `{param}` placeholders. Running an operation means validating its
//! parameters, rendering the template and handing the source to the
//! sandbox, so operations share the exact fault handling of raw code.

use serde_json::{json, Map, Value};

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamType {
    Number,
    Text,
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDefault {
    Number(f64),
    Text(&'static str),
}

impl ParamDefault {
    fn to_json(self) -> Value {
        match self {
            Self::Number(n) => json!(n),
            Self::Text(s) => json!(s),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub ty: ParamType,
    /// `None` marks the parameter as required.
    pub default: Option<ParamDefault>,
}

impl ParamSpec {
    pub const fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

const fn number_or(name: &'static str, description: &'static str, default: f64) -> ParamSpec {
    ParamSpec {
        name,
        description,
        ty: ParamType::Number,
        default: Some(ParamDefault::Number(default)),
    }
}

const fn text(name: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        description,
        ty: ParamType::Text,
        default: None,
    }
}

const fn text_or(name: &'static str, description: &'static str, default: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        description,
        ty: ParamType::Text,
        default: Some(ParamDefault::Text(default)),
    }
}

const fn choice_or(
    name: &'static str,
    description: &'static str,
    options: &'static [&'static str],
    default: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        description,
        ty: ParamType::Choice(options),
        default: Some(ParamDefault::Text(default)),
    }
}

const PLANES: &[&str] = &["xy", "yz", "xz"];
const AXES: &[&str] = &["x", "y", "z"];
const BOOLEAN_OPS: &[&str] = &["join", "cut", "intersect"];
const EDGE_FILTERS: &[&str] = &["all", "circular"];

/// Shape parameters followed by the shared placement parameters.
macro_rules! shape_params {
    ($($param:expr),* $(,)?) => {
        &[
            $($param,)*
            text_or("name", "Body name (automatic when omitted)", ""),
            choice_or("plane", "Sketch plane", PLANES, "xy"),
            number_or("cx", "Center X (mm)", 0.0),
            number_or("cy", "Center Y (mm)", 0.0),
            number_or("cz", "Center Z (mm)", 0.0),
        ]
    };
}

/// One catalog entry.
#[derive(Debug)]
pub struct Operation {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub template: &'static str,
}

static OPERATIONS: &[Operation] = &[
    Operation {
        name: "create_cube",
        description: "Create a cube with the given edge length (mm).",
        params: shape_params![number_or("size", "Edge length (mm)", 10.0)],
        template: "result = root.add_box({name}, {size}, {size}, {size}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "create_box",
        description: "Create a rectangular box.",
        params: shape_params![
            number_or("width", "Width (mm)", 10.0),
            number_or("depth", "Depth (mm)", 10.0),
            number_or("height", "Height (mm)", 10.0),
        ],
        template: "result = root.add_box({name}, {width}, {depth}, {height}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "create_cylinder",
        description: "Create a cylinder.",
        params: shape_params![
            number_or("radius", "Radius (mm)", 5.0),
            number_or("height", "Height (mm)", 10.0),
        ],
        template: "result = root.add_cylinder({name}, {radius}, {height}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "create_sphere",
        description: "Create a sphere.",
        params: shape_params![number_or("radius", "Radius (mm)", 5.0)],
        template: "result = root.add_sphere({name}, {radius}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "create_cone",
        description: "Create a cone.",
        params: shape_params![
            number_or("radius", "Base radius (mm)", 5.0),
            number_or("height", "Height (mm)", 10.0),
        ],
        template: "result = root.add_cone({name}, {radius}, {height}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "create_sq_pyramid",
        description: "Create a square pyramid.",
        params: shape_params![
            number_or("side_length", "Base side length (mm)", 10.0),
            number_or("height", "Height (mm)", 10.0),
        ],
        template: "result = root.add_pyramid({name}, 4, {side_length}, {height}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "create_tri_pyramid",
        description: "Create a regular triangular pyramid.",
        params: shape_params![
            number_or("side_length", "Base side length (mm)", 10.0),
            number_or("height", "Height (mm)", 10.0),
        ],
        template: "result = root.add_pyramid({name}, 3, {side_length}, {height}, {plane}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "select_body",
        description: "Select one body by name.",
        params: &[text("body_name", "Body to select")],
        template: "ui.select_body({body_name});",
    },
    Operation {
        name: "select_bodies",
        description: "Select two bodies by name (for combine_selection).",
        params: &[
            text("body_name1", "First body (kept by combine)"),
            text("body_name2", "Second body"),
        ],
        template: "ui.select_bodies({body_name1}, {body_name2});",
    },
    Operation {
        name: "select_edges",
        description: "Select the edges of a body. Returns the number selected.",
        params: &[
            text("body_name", "Body whose edges are selected"),
            choice_or("edge_type", "Which edges", EDGE_FILTERS, "all"),
        ],
        template: "result = ui.select_edges({body_name}, {edge_type});",
    },
    Operation {
        name: "add_fillet",
        description: "Fillet the selected edges. Select edges with select_edges first.",
        params: &[number_or("radius", "Fillet radius (mm)", 1.0)],
        template: "root.fillet_selection({radius});",
    },
    Operation {
        name: "move_selection",
        description: "Translate the selected bodies. Select bodies first.",
        params: &[
            number_or("x_dist", "X distance (mm)", 0.0),
            number_or("y_dist", "Y distance (mm)", 0.0),
            number_or("z_dist", "Z distance (mm)", 0.0),
        ],
        template: "root.move_selection(vector3d({x_dist}, {y_dist}, {z_dist}));",
    },
    Operation {
        name: "rotate_selection",
        description: "Rotate the selected bodies about a pivot. Select bodies first.",
        params: &[
            choice_or("axis", "Rotation axis", AXES, "z"),
            number_or("angle", "Angle (degrees)", 0.0),
            number_or("cx", "Pivot X (mm)", 0.0),
            number_or("cy", "Pivot Y (mm)", 0.0),
            number_or("cz", "Pivot Z (mm)", 0.0),
        ],
        template: "root.rotate_selection({axis}, {angle}, point3d({cx}, {cy}, {cz}));",
    },
    Operation {
        name: "combine_selection",
        description: "Boolean-combine the two selected bodies. Select them with select_bodies first.",
        params: &[choice_or("operation", "Boolean operation", BOOLEAN_OPS, "join")],
        template: "result = root.combine_selection({operation});",
    },
    Operation {
        name: "combine_by_name",
        description: "Boolean-combine two bodies by name; the target is kept.",
        params: &[
            text("target_body", "Body that remains"),
            text("tool_body", "Body consumed by the operation"),
            choice_or("operation", "Boolean operation", BOOLEAN_OPS, "join"),
        ],
        template: "root.combine({target_body}, {tool_body}, {operation}); result = {target_body};",
    },
    Operation {
        name: "undo",
        description: "Undo the last modeling change.",
        params: &[],
        template: "root.undo();",
    },
    Operation {
        name: "redo",
        description: "Redo the last undone change.",
        params: &[],
        template: "root.redo();",
    },
];

/// All catalog entries.
pub fn operations() -> &'static [Operation] {
    OPERATIONS
}

pub fn find(name: &str) -> Option<&'static Operation> {
    OPERATIONS.iter().find(|op| op.name == name)
}

/// Look up `name` and render it with `parameters` into script source.
pub fn expand(name: &str, parameters: &Map<String, Value>) -> Result<String, BridgeError> {
    let op = find(name).ok_or_else(|| unknown_operation(name))?;
    let params = op.validate(parameters)?;
    Ok(op.render(&params))
}

fn unknown_operation(name: &str) -> BridgeError {
    let known: Vec<_> = OPERATIONS.iter().map(|op| op.name).collect();
    BridgeError::MalformedCommand(format!(
        "unknown operation '{name}'. Available: {known:?}"
    ))
}

impl Operation {
    /// Check `parameters` against the declared list and fill in defaults.
    pub fn validate(&self, parameters: &Map<String, Value>) -> Result<Map<String, Value>, BridgeError> {
        let malformed = |msg: String| BridgeError::MalformedCommand(format!("{}: {msg}", self.name));

        if let Some(unknown) = parameters
            .keys()
            .find(|key| !self.params.iter().any(|p| p.name == key.as_str()))
        {
            let allowed: Vec<_> = self.params.iter().map(|p| p.name).collect();
            return Err(malformed(format!(
                "unknown parameter '{unknown}', expected one of {allowed:?}"
            )));
        }

        let mut normalized = Map::new();
        for spec in self.params {
            let value = match (parameters.get(spec.name), spec.default) {
                (Some(Value::Null) | None, Some(default)) => default.to_json(),
                (Some(Value::Null) | None, None) => {
                    return Err(malformed(format!("missing required parameter '{}'", spec.name)));
                }
                (Some(value), _) => check_value(spec, value).map_err(malformed)?,
            };
            normalized.insert(spec.name.to_string(), value);
        }
        Ok(normalized)
    }

    /// JSON schema of the parameters, for tool listings.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in self.params {
            let mut prop = match spec.ty {
                ParamType::Number => json!({ "type": "number" }),
                ParamType::Text => json!({ "type": "string" }),
                ParamType::Choice(options) => json!({ "type": "string", "enum": options }),
            };
            prop["description"] = json!(spec.description);
            if let Some(default) = spec.default {
                prop["default"] = default.to_json();
            }
            properties.insert(spec.name.to_string(), prop);
        }
        let required: Vec<_> = self
            .params
            .iter()
            .filter(|p| p.is_required())
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Substitute `{param}` placeholders with script literals.
    ///
    /// Single pass, so substituted text is never rescanned.
    fn render(&self, params: &Map<String, Value>) -> String {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut rest = self.template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if params.contains_key(&after[..close]) => {
                    out.push_str(&script_literal(&params[&after[..close]]));
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn check_value(spec: &ParamSpec, value: &Value) -> Result<Value, String> {
    match spec.ty {
        ParamType::Number => match value.as_f64() {
            Some(n) if n.is_finite() => Ok(json!(n)),
            _ => Err(format!("parameter '{}' must be a finite number", spec.name)),
        },
        ParamType::Text => value
            .as_str()
            .map(|s| json!(s))
            .ok_or_else(|| format!("parameter '{}' must be a string", spec.name)),
        ParamType::Choice(options) => {
            let chosen = value.as_str().map(str::to_ascii_lowercase);
            match chosen {
                Some(s) if options.contains(&s.as_str()) => Ok(json!(s)),
                _ => Err(format!(
                    "parameter '{}' must be one of {options:?}",
                    spec.name
                )),
            }
        }
    }
}

/// Render a validated JSON value as a Rhai literal.
fn script_literal(value: &Value) -> String {
    match value {
        Value::Number(n) => {
            let text = n.as_f64().unwrap_or_default().to_string();
            if text.contains('.') {
                text
            } else {
                format!("{text}.0")
            }
        }
        Value::String(s) => {
            let mut lit = String::with_capacity(s.len() + 2);
            lit.push('"');
            for c in s.chars() {
                match c {
                    '"' => lit.push_str("\\\""),
                    '\\' => lit.push_str("\\\\"),
                    '\n' => lit.push_str("\\n"),
                    '\r' => lit.push_str("\\r"),
                    '\t' => lit.push_str("\\t"),
                    c if c.is_control() => {}
                    c => lit.push(c),
                }
            }
            lit.push('"');
            lit
        }
        other => other.to_string(),
    }
}
