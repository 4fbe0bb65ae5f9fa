/// Embedded interpreter plumbing shared by both execution strategies.
///
/// A fresh interpreter is built per submission: frozen stdlib, native module
/// inits, an import hook enforcing the policy allow-list, captured
/// stdout/stderr, and poisoned stubs shadowing the deny-listed builtins in
/// the submission namespace. Nothing here persists across submissions, so
/// one submission can never observe another's monkey-patching.
use crate::config::policy::ExecutionPolicy;
use crate::config::types::CaseInput;
use crate::utils::output::OutputBuffer;
use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyDict, PyList, PyStr, PyTuple},
    function::{FuncArgs, KwArgs},
    scope::Scope,
    AsObject, Interpreter, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};
use std::sync::Arc;

/// Build an interpreter with the frozen stdlib and native modules.
pub fn build_interpreter() -> Interpreter {
    Interpreter::with_init(rustpython_vm::Settings::default(), |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
    })
}

/// Structured description of a Python exception.
#[derive(Clone, Debug)]
pub struct ExceptionDetails {
    pub type_name: String,
    pub message: String,
    pub traceback: String,
}

impl ExceptionDetails {
    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}: {}", self.type_name, self.message)
        }
    }

    /// A ceiling breach inside the interpreter surfaces as MemoryError;
    /// classified separately from ordinary runtime faults.
    pub fn is_memory_error(&self) -> bool {
        self.type_name == "MemoryError"
    }
}

/// Extract type name, message, and formatted traceback from an exception.
pub fn exception_details(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> ExceptionDetails {
    let type_name = exc.class().name().to_string();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default();
    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, exc);
    ExceptionDetails {
        type_name,
        message,
        traceback,
    }
}

/// Returns `true` when an import originates from the submission itself
/// rather than from stdlib internals. Submission code runs with
/// `__name__ == "__main__"`; real modules carry their own name.
fn is_submission_import(args: &FuncArgs, vm: &VirtualMachine) -> bool {
    let globals = match args.args.get(1) {
        Some(g) if !vm.is_none(g) => g,
        _ => return true,
    };
    match vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),)) {
        Ok(name) if !vm.is_none(&name) => name
            .str(vm)
            .map(|s| s.as_str() == "__main__")
            .unwrap_or(true),
        _ => true,
    }
}

/// Override `builtins.__import__` so submission-originated imports are
/// gated by the policy allow-list. Stdlib-internal imports pass through
/// untouched, which lets allowed packages load their own dependencies.
pub fn install_import_hook(vm: &VirtualMachine, policy: &Arc<ExecutionPolicy>) {
    let original_import = match vm.builtins.get_attr("__import__", vm) {
        Ok(f) => f,
        Err(_) => return,
    };

    #[allow(clippy::arc_with_non_send_sync)]
    let original_import = Arc::new(original_import);
    let policy = Arc::clone(policy);

    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            if is_submission_import(&args, vm) {
                let denied = policy.is_module_blocked(&module_name)
                    || !policy.is_module_allowed(&module_name);
                if denied {
                    return Err(vm.new_import_error(
                        format!("import of module '{module_name}' is not permitted"),
                        vm.ctx.new_str(module_name.clone()),
                    ));
                }
            }

            original_import.call(args, vm)
        },
    );

    let _ = vm.builtins.set_attr("__import__", hook, vm);
}

/// Replace `sys.stdout`/`sys.stderr` with writers draining into the capped
/// capture buffers.
pub fn install_output_capture(vm: &VirtualMachine, stdout: OutputBuffer, stderr: OutputBuffer) {
    let stdout_obj = build_writer(vm, stdout);
    let stderr_obj = build_writer(vm, stderr);
    let _ = vm.sys_module.set_attr("stdout", stdout_obj, vm);
    let _ = vm.sys_module.set_attr("stderr", stderr_obj, vm);
}

/// Minimal file-like object: `write(s)` appends to the buffer, `flush()` is
/// a no-op. `print()` only ever calls these two.
fn build_writer(vm: &VirtualMachine, buffer: OutputBuffer) -> PyObjectRef {
    let write_buffer = buffer.clone();
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            write_buffer.write(data.as_bytes());
            Ok(vm.ctx.new_int(data.len()).into())
        },
    );
    let flush_fn = vm.new_function(
        "flush",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            Ok(vm.ctx.none())
        },
    );

    let ns = vm.new_module("<capture>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

/// Shadow each deny-listed builtin with a stub that raises. Shadowing lives
/// in the submission's globals, so stdlib module internals keep their real
/// builtins while submission code resolves the stub first.
pub fn seed_restricted_namespace(vm: &VirtualMachine, scope: &Scope, policy: &ExecutionPolicy) {
    let _ = scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);

    for name in &policy.blocked_callables {
        let denied = name.clone();
        let stub = vm.new_function(
            "blocked",
            move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                Err(vm.new_exception_msg(
                    vm.ctx.exceptions.runtime_error.to_owned(),
                    format!("use of '{denied}' is not permitted in the sandbox"),
                ))
            },
        );
        let _ = scope.globals.set_item(name.as_str(), stub.into(), vm);
    }
}

/// Convert a JSON value into a Python object.
pub fn json_to_py(vm: &VirtualMachine, value: &serde_json::Value) -> PyResult<PyObjectRef> {
    use serde_json::Value;
    Ok(match value {
        Value::Null => vm.ctx.none(),
        Value::Bool(b) => vm.ctx.new_bool(*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                vm.ctx.new_int(i).into()
            } else {
                vm.ctx.new_float(n.as_f64().unwrap_or(f64::NAN)).into()
            }
        }
        Value::String(s) => vm.ctx.new_str(s.as_str()).into(),
        Value::Array(items) => {
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                elements.push(json_to_py(vm, item)?);
            }
            vm.ctx.new_list(elements).into()
        }
        Value::Object(map) => {
            let dict = vm.ctx.new_dict();
            for (key, item) in map {
                dict.set_item(key.as_str(), json_to_py(vm, item)?, vm)?;
            }
            dict.into()
        }
    })
}

/// Convert a Python object back into a JSON value for comparison and
/// reporting. Objects without a natural JSON shape fall back to `repr()`.
pub fn py_to_json(vm: &VirtualMachine, obj: &PyObjectRef) -> serde_json::Value {
    use serde_json::Value;

    if vm.is_none(obj) {
        return Value::Null;
    }
    if obj.fast_isinstance(vm.ctx.types.bool_type) {
        if let Ok(b) = bool::try_from_object(vm, obj.clone()) {
            return Value::Bool(b);
        }
    }
    if obj.fast_isinstance(vm.ctx.types.int_type) {
        if let Ok(i) = i64::try_from_object(vm, obj.clone()) {
            return Value::from(i);
        }
        // Magnitude beyond i64: fall through to repr.
    }
    if obj.fast_isinstance(vm.ctx.types.float_type) {
        if let Ok(f) = f64::try_from_object(vm, obj.clone()) {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    if let Some(s) = obj.payload::<PyStr>() {
        return Value::String(s.as_str().to_owned());
    }
    if let Some(list) = obj.payload::<PyList>() {
        let items = list.borrow_vec().to_vec();
        return Value::Array(items.iter().map(|item| py_to_json(vm, item)).collect());
    }
    if let Some(tuple) = obj.payload::<PyTuple>() {
        return Value::Array(
            tuple
                .as_slice()
                .iter()
                .map(|item| py_to_json(vm, item))
                .collect(),
        );
    }
    if obj.payload::<PyDict>().is_some() {
        if let Ok(items) = vm.call_method(obj, "items", ()) {
            if let Ok(pairs) = vm.extract_elements::<PyObjectRef>(&items) {
                let mut map = serde_json::Map::new();
                for pair in pairs {
                    if let Some(tuple) = pair.payload::<PyTuple>() {
                        let slice = tuple.as_slice();
                        if slice.len() == 2 {
                            let key = slice[0]
                                .str(vm)
                                .map(|s| s.as_str().to_owned())
                                .unwrap_or_default();
                            map.insert(key, py_to_json(vm, &slice[1]));
                        }
                    }
                }
                return Value::Object(map);
            }
        }
    }

    obj.repr(vm)
        .map(|s| Value::String(s.as_str().to_owned()))
        .unwrap_or(Value::Null)
}

/// Build call arguments for a test case.
pub fn build_case_args(vm: &VirtualMachine, input: &CaseInput) -> PyResult<FuncArgs> {
    match input {
        CaseInput::Positional(items) => {
            let mut args = Vec::with_capacity(items.len());
            for item in items {
                args.push(json_to_py(vm, item)?);
            }
            Ok(FuncArgs::new(args, KwArgs::default()))
        }
        CaseInput::Keyword(map) => {
            let mut kwargs = Vec::with_capacity(map.len());
            for (key, item) in map {
                kwargs.push((key.clone(), json_to_py(vm, item)?));
            }
            Ok(FuncArgs::new(
                Vec::<PyObjectRef>::new(),
                KwArgs::from_iter(kwargs),
            ))
        }
        CaseInput::Single(value) => {
            let arg = json_to_py(vm, value)?;
            Ok(FuncArgs::new(vec![arg], KwArgs::default()))
        }
    }
}
