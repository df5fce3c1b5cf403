//! Dynamic execution sandbox.
//!
//! Snippets are Rhai scripts. Each run gets a fresh scope holding only:
//!
//! | name | what |
//! |------|------|
//! | `app` | application handle (`name`, `version`, `log(text)`) |
//! | `root` | root component of the active design |
//! | `ui` | user interface: message box and selection |
//! | `point3d(x, y, z)`, `vector3d(x, y, z)` | geometry constructors |
//! | `result` | output slot, unit until the script assigns it |
//!
//! Module imports are disabled and `print`/`debug` go to tracing, so a
//! snippet cannot reach files, the process environment or the channel.

use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Scope};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::BridgeError;
use crate::host::{
    Application, DocumentError, HostContext, Point3D, RootComponent, Shape, UserInterface,
    Vector3D,
};

/// Name of the variable whose final value becomes the response value.
pub const RESULT_SLOT: &str = "result";

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Evaluates snippets against a `HostContext`.
pub struct Sandbox {
    engine: Engine,
}

impl Sandbox {
    /// `max_operations` bounds a single run; 0 disables the limit.
    pub fn new(max_operations: u64) -> Self {
        let mut engine = Engine::new();
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        if max_operations > 0 {
            engine.set_max_operations(max_operations);
        }
        engine.on_print(|text| info!(target: "script", "{text}"));
        engine.on_debug(|text, _source, pos| debug!(target: "script", %pos, "{text}"));
        register_host_api(&mut engine);
        Self { engine }
    }

    /// Run `source` and return the value left in `result`, if any.
    #[instrument(skip_all, fields(source_len = source.len()))]
    pub fn run(&self, host: &HostContext, source: &str) -> Result<Option<Value>, BridgeError> {
        let mut scope = Scope::new();
        scope.push("app", host.application());
        scope.push("root", host.root());
        scope.push("ui", host.ui());
        scope.push(RESULT_SLOT, Dynamic::UNIT);

        self.engine
            .run_with_scope(&mut scope, source)
            .map_err(|e| BridgeError::HostExecutionFailure(e.to_string()))?;

        let result = scope
            .get_value::<Dynamic>(RESULT_SLOT)
            .unwrap_or(Dynamic::UNIT);
        if result.is_unit() {
            return Ok(None);
        }
        rhai::serde::from_dynamic::<Value>(&result)
            .map(Some)
            .map_err(|e| {
                BridgeError::HostExecutionFailure(format!(
                    "result of type '{}' is not serializable: {e}",
                    result.type_name()
                ))
            })
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(0)
    }
}

fn host_err(err: DocumentError) -> Box<EvalAltResult> {
    err.to_string().into()
}

/// Accept both integer and float literals where the host expects a length.
#[allow(clippy::cast_precision_loss)]
fn number(value: &Dynamic) -> ScriptResult<f64> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as f64))
        .map_err(|type_name| format!("expected a number, got {type_name}").into())
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn register_host_api(engine: &mut Engine) {
    register_geometry(engine);
    register_application(engine);
    register_root(engine);
    register_ui(engine);
}

fn register_geometry(engine: &mut Engine) {
    engine
        .register_type_with_name::<Point3D>("Point3D")
        .register_fn(
            "point3d",
            |x: Dynamic, y: Dynamic, z: Dynamic| -> ScriptResult<Point3D> {
                Ok(Point3D::new(number(&x)?, number(&y)?, number(&z)?))
            },
        )
        .register_get("x", |p: &mut Point3D| p.x)
        .register_get("y", |p: &mut Point3D| p.y)
        .register_get("z", |p: &mut Point3D| p.z)
        .register_type_with_name::<Vector3D>("Vector3D")
        .register_fn(
            "vector3d",
            |x: Dynamic, y: Dynamic, z: Dynamic| -> ScriptResult<Vector3D> {
                Ok(Vector3D::new(number(&x)?, number(&y)?, number(&z)?))
            },
        )
        .register_get("x", |v: &mut Vector3D| v.x)
        .register_get("y", |v: &mut Vector3D| v.y)
        .register_get("z", |v: &mut Vector3D| v.z);
}

fn register_application(engine: &mut Engine) {
    engine
        .register_type_with_name::<Application>("Application")
        .register_get("name", |app: &mut Application| app.name())
        .register_get("version", |app: &mut Application| app.version())
        .register_fn("log", |app: &mut Application, text: ImmutableString| {
            app.log(&text);
        });
}

fn register_root(engine: &mut Engine) {
    engine
        .register_type_with_name::<RootComponent>("RootComponent")
        .register_fn(
            "add_box",
            |root: &mut RootComponent,
             name: ImmutableString,
             width: Dynamic,
             depth: Dynamic,
             height: Dynamic,
             plane: ImmutableString,
             center: Point3D|
             -> ScriptResult<String> {
                let shape = Shape::Box {
                    width: number(&width)?,
                    depth: number(&depth)?,
                    height: number(&height)?,
                };
                root.add_body(&name, shape, &plane, center).map_err(host_err)
            },
        )
        .register_fn(
            "add_cylinder",
            |root: &mut RootComponent,
             name: ImmutableString,
             radius: Dynamic,
             height: Dynamic,
             plane: ImmutableString,
             center: Point3D|
             -> ScriptResult<String> {
                let shape = Shape::Cylinder {
                    radius: number(&radius)?,
                    height: number(&height)?,
                };
                root.add_body(&name, shape, &plane, center).map_err(host_err)
            },
        )
        .register_fn(
            "add_sphere",
            |root: &mut RootComponent,
             name: ImmutableString,
             radius: Dynamic,
             plane: ImmutableString,
             center: Point3D|
             -> ScriptResult<String> {
                let shape = Shape::Sphere {
                    radius: number(&radius)?,
                };
                root.add_body(&name, shape, &plane, center).map_err(host_err)
            },
        )
        .register_fn(
            "add_cone",
            |root: &mut RootComponent,
             name: ImmutableString,
             radius: Dynamic,
             height: Dynamic,
             plane: ImmutableString,
             center: Point3D|
             -> ScriptResult<String> {
                let shape = Shape::Cone {
                    radius: number(&radius)?,
                    height: number(&height)?,
                };
                root.add_body(&name, shape, &plane, center).map_err(host_err)
            },
        )
        .register_fn(
            "add_pyramid",
            |root: &mut RootComponent,
             name: ImmutableString,
             sides: i64,
             side_length: Dynamic,
             height: Dynamic,
             plane: ImmutableString,
             center: Point3D|
             -> ScriptResult<String> {
                let sides = u8::try_from(sides)
                    .ok()
                    .filter(|n| *n >= 3)
                    .ok_or_else(|| format!("a pyramid needs at least 3 sides, got {sides}"))?;
                let shape = Shape::Pyramid {
                    sides,
                    side_length: number(&side_length)?,
                    height: number(&height)?,
                };
                root.add_body(&name, shape, &plane, center).map_err(host_err)
            },
        )
        .register_fn(
            "body",
            |root: &mut RootComponent, name: ImmutableString| -> ScriptResult<Dynamic> {
                let body = root.body(&name).map_err(host_err)?;
                rhai::serde::to_dynamic(&body)
            },
        )
        .register_fn("body_names", |root: &mut RootComponent| -> Array {
            root.body_names().into_iter().map(Dynamic::from).collect()
        })
        .register_get("body_count", |root: &mut RootComponent| {
            count(root.body_names().len())
        })
        .register_fn(
            "combine",
            |root: &mut RootComponent,
             target: ImmutableString,
             tool: ImmutableString,
             operation: ImmutableString|
             -> ScriptResult<()> {
                root.combine(&target, &tool, &operation).map_err(host_err)
            },
        )
        .register_fn(
            "combine_selection",
            |root: &mut RootComponent, operation: ImmutableString| -> ScriptResult<String> {
                root.combine_selection(&operation).map_err(host_err)
            },
        )
        .register_fn(
            "move_selection",
            |root: &mut RootComponent, offset: Vector3D| -> ScriptResult<()> {
                root.move_selection(offset).map_err(host_err)
            },
        )
        .register_fn(
            "rotate_selection",
            |root: &mut RootComponent,
             axis: ImmutableString,
             degrees: Dynamic,
             pivot: Point3D|
             -> ScriptResult<()> {
                root.rotate_selection(&axis, number(&degrees)?, pivot)
                    .map_err(host_err)
            },
        )
        .register_fn(
            "fillet_selection",
            |root: &mut RootComponent, radius: Dynamic| -> ScriptResult<()> {
                root.fillet_selection(number(&radius)?).map_err(host_err)
            },
        )
        .register_fn("undo", |root: &mut RootComponent| -> ScriptResult<()> {
            root.undo().map_err(host_err)
        })
        .register_fn("redo", |root: &mut RootComponent| -> ScriptResult<()> {
            root.redo().map_err(host_err)
        });
}

fn register_ui(engine: &mut Engine) {
    engine
        .register_type_with_name::<UserInterface>("UserInterface")
        .register_fn("message_box", |ui: &mut UserInterface, text: ImmutableString| {
            ui.message_box(&text);
        })
        .register_fn(
            "select_body",
            |ui: &mut UserInterface, name: ImmutableString| -> ScriptResult<()> {
                ui.select_body(&name).map_err(host_err)
            },
        )
        .register_fn(
            "select_bodies",
            |ui: &mut UserInterface,
             first: ImmutableString,
             second: ImmutableString|
             -> ScriptResult<()> { ui.select_bodies(&first, &second).map_err(host_err) },
        )
        .register_fn(
            "select_edges",
            |ui: &mut UserInterface,
             body: ImmutableString,
             filter: ImmutableString|
             -> ScriptResult<i64> {
                ui.select_edges(&body, &filter).map(count).map_err(host_err)
            },
        )
        .register_fn("clear_selection", |ui: &mut UserInterface| {
            ui.clear_selection();
        })
        .register_get("selection_count", |ui: &mut UserInterface| {
            count(ui.selection_count())
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn run(source: &str) -> (HostContext, Result<Option<Value>, BridgeError>) {
        let host = HostContext::default();
        let result = Sandbox::new(100_000).run(&host, source);
        (host, result)
    }

    #[test]
    fn result_slot_becomes_value() {
        let (_, result) = run("result = 1 + 1;");
        assert_eq!(result.unwrap(), Some(json!(2)));
    }

    #[test]
    fn unset_result_is_absent() {
        let (host, result) = run(r#"ui.message_box("side effect only");"#);
        assert_eq!(result.unwrap(), None);
        assert_eq!(host.ui_messages(), vec!["side effect only".to_string()]);
    }

    #[test]
    fn unbound_name_is_a_host_failure() {
        let (_, result) = run("undefined_name.do_thing();");
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostExecutionFailure);
        assert!(err.message().contains("undefined_name"), "{err}");
    }

    #[test]
    fn syntax_errors_are_contained() {
        let (_, result) = run("let x = ;");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::HostExecutionFailure);
    }

    #[test]
    fn host_api_rejections_keep_their_message() {
        let (_, result) = run(r#"root.add_sphere("s", -2, "xy", point3d(0, 0, 0));"#);
        let err = result.unwrap_err();
        assert!(err.message().contains("radius must be a positive"), "{err}");
    }

    #[test]
    fn scripts_mutate_live_state() {
        let source = r#"
            let name = root.add_box("plate", 40, 20.5, 2, "xy", point3d(0, 0, 1));
            ui.select_body(name);
            root.move_selection(vector3d(5, 0, 0));
            result = root.body(name);
        "#;
        let (host, result) = run(source);
        let value = result.unwrap().unwrap();
        assert_eq!(value["name"], "plate");
        assert_eq!(value["shape"]["type"], "box");
        assert_eq!(value["center"]["x"], 5.0);
        assert_eq!(host.document().bodies().len(), 1);
    }

    #[test]
    fn maps_and_arrays_serialize() {
        let (_, result) = run(r#"result = #{ names: root.body_names(), app: app.name };"#);
        assert_eq!(result.unwrap(), Some(json!({"names": [], "app": "cad-host"})));
    }

    #[test]
    fn opaque_results_are_rejected() {
        let (_, result) = run("result = point3d(1, 2, 3);");
        let err = result.unwrap_err();
        assert!(err.message().contains("Point3D"), "{err}");
    }

    #[test]
    fn runaway_scripts_hit_the_operation_budget() {
        let (_, result) = run("loop { }");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::HostExecutionFailure);
    }

    #[test]
    fn imports_are_disabled() {
        let (_, result) = run(r#"import "std" as s;"#);
        assert!(result.is_err());
    }

    #[test]
    fn each_run_starts_clean() {
        let host = HostContext::default();
        let sandbox = Sandbox::default();
        sandbox
            .run(&host, "fn helper() { 41 } let leftover = 1; result = helper() + 1;")
            .unwrap();
        assert!(sandbox.run(&host, "result = leftover;").is_err());
        assert!(sandbox.run(&host, "result = helper();").is_err());
        assert_eq!(sandbox.run(&host, "1;").unwrap(), None);
    }
}
