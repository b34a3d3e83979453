//! AST-walking evaluator
//!
//! Works directly on guest values; handle allocation only happens at the
//! engine API boundary. Uncaught `throw` surfaces as
//! [`VmError::Exception`] carrying an owned handle to the thrown value.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{VmError, VmResult};
use crate::object::{FnImpl, FunctionData, GuestObject, PropertyKey, ScriptFunction, object_ref};
use crate::parser::{BinOp, Body, Expr, Stmt, UnOp};
use crate::value::GuestValue;
use crate::vm::Vm;

/// A lexical environment frame. Parameters of enclosing arrows are
/// readable and assignable; unknown names fall through to globals.
pub struct Env {
    vars: RefCell<HashMap<String, GuestValue>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    /// Root environment with no bindings
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        })
    }

    /// Child frame binding `params` to `args` (missing args are undefined)
    pub fn child(parent: Rc<Self>, params: &[String], args: Vec<GuestValue>) -> Rc<Self> {
        let mut vars = HashMap::with_capacity(params.len());
        let mut args = args.into_iter();
        for p in params {
            vars.insert(p.clone(), args.next().unwrap_or(GuestValue::Undefined));
        }
        Rc::new(Self {
            vars: RefCell::new(vars),
            parent: Some(parent),
        })
    }

    fn lookup(&self, name: &str) -> Option<GuestValue> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.lookup(name))
    }

    fn assign_existing(&self, name: &str, value: &GuestValue) -> bool {
        if self.vars.borrow().contains_key(name) {
            self.vars.borrow_mut().insert(name.to_string(), value.clone());
            return true;
        }
        self.parent
            .as_ref()
            .map(|p| p.assign_existing(name, value))
            .unwrap_or(false)
    }
}

/// Statement outcome
pub(crate) enum Flow {
    Normal(GuestValue),
    Return(GuestValue),
}

/// Evaluate a program at top level; the result is the value of the last
/// expression statement (or of an explicit top-level `return`).
pub(crate) fn eval_program(vm: &Vm, stmts: &[Stmt]) -> VmResult<GuestValue> {
    let env = Env::root();
    match eval_stmts(vm, stmts, &env)? {
        Flow::Normal(v) | Flow::Return(v) => Ok(v),
    }
}

fn eval_stmts(vm: &Vm, stmts: &[Stmt], env: &Rc<Env>) -> VmResult<Flow> {
    let mut last = GuestValue::Undefined;
    for stmt in stmts {
        match stmt {
            Stmt::Expr(e) => last = eval_expr(vm, e, env)?,
            Stmt::Return(e) => {
                let v = match e {
                    Some(e) => eval_expr(vm, e, env)?,
                    None => GuestValue::Undefined,
                };
                return Ok(Flow::Return(v));
            }
            Stmt::Throw(e) => {
                let v = eval_expr(vm, e, env)?;
                return Err(vm.throw_value(v));
            }
        }
    }
    Ok(Flow::Normal(last))
}

/// Run a script function body
pub(crate) fn call_script(
    vm: &Vm,
    func: &ScriptFunction,
    args: Vec<GuestValue>,
) -> VmResult<GuestValue> {
    let env = Env::child(func.env.clone(), &func.params, args);
    match &func.body {
        Body::Expr(e) => eval_expr(vm, e, &env),
        Body::Block(stmts) => match eval_stmts(vm, stmts, &env)? {
            Flow::Return(v) => Ok(v),
            Flow::Normal(_) => Ok(GuestValue::Undefined),
        },
    }
}

fn eval_expr(vm: &Vm, expr: &Expr, env: &Rc<Env>) -> VmResult<GuestValue> {
    match expr {
        Expr::Number(n) => Ok(GuestValue::Number(*n)),
        Expr::Str(s) => Ok(GuestValue::String(Rc::from(s.as_str()))),
        Expr::Bool(b) => Ok(GuestValue::Bool(*b)),
        Expr::Null => Ok(GuestValue::Null),
        Expr::Undefined => Ok(GuestValue::Undefined),
        Expr::Ident(name) => {
            if name == "globalThis" {
                return Ok(vm.global_value());
            }
            if let Some(v) = env.lookup(name) {
                return Ok(v);
            }
            let global = vm.global_value();
            let key = PropertyKey::string(name);
            if vm.has_prop_value(&global, &key)? {
                vm.get_prop_value(&global, &key, global.clone())
            } else {
                Err(VmError::reference_error(format!("{name} is not defined")))
            }
        }
        Expr::Member(obj, name) => {
            let target = eval_expr(vm, obj, env)?;
            vm.get_prop_value(&target, &PropertyKey::string(name), target.clone())
        }
        Expr::Index(obj, idx) => {
            let target = eval_expr(vm, obj, env)?;
            let key = index_key(vm, eval_expr(vm, idx, env)?)?;
            vm.get_prop_value(&target, &key, target.clone())
        }
        Expr::Assign(target, value) => {
            let v = eval_expr(vm, value, env)?;
            match &**target {
                Expr::Ident(name) => {
                    if !env.assign_existing(name, &v) {
                        let global = vm.global_value();
                        vm.set_prop_value(&global, PropertyKey::string(name), v.clone())?;
                    }
                }
                Expr::Member(obj, name) => {
                    let o = eval_expr(vm, obj, env)?;
                    vm.set_prop_value(&o, PropertyKey::string(name), v.clone())?;
                }
                Expr::Index(obj, idx) => {
                    let o = eval_expr(vm, obj, env)?;
                    let key = index_key(vm, eval_expr(vm, idx, env)?)?;
                    vm.set_prop_value(&o, key, v.clone())?;
                }
                _ => return Err(VmError::type_error("invalid assignment target")),
            }
            Ok(v)
        }
        Expr::Binary(op, lhs, rhs) => {
            let a = eval_expr(vm, lhs, env)?;
            let b = eval_expr(vm, rhs, env)?;
            binary(*op, a, b)
        }
        Expr::Unary(op, inner) => {
            let v = eval_expr(vm, inner, env)?;
            match op {
                UnOp::Not => Ok(GuestValue::Bool(!v.is_truthy())),
                UnOp::Neg => match v {
                    GuestValue::Number(n) => Ok(GuestValue::Number(-n)),
                    other => Err(VmError::type_error(format!(
                        "cannot negate {}",
                        other.type_of()
                    ))),
                },
            }
        }
        Expr::Arrow(params, body) => {
            let func = ScriptFunction {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
            };
            Ok(GuestValue::Object(object_ref(GuestObject::function(
                FunctionData {
                    name: Rc::from(""),
                    imp: FnImpl::Script(Rc::new(func)),
                },
            ))))
        }
        Expr::Call(callee, args) => {
            let (func, this) = match &**callee {
                Expr::Member(obj, name) => {
                    let target = eval_expr(vm, obj, env)?;
                    let f = vm.get_prop_value(&target, &PropertyKey::string(name), target.clone())?;
                    (f, target)
                }
                Expr::Index(obj, idx) => {
                    let target = eval_expr(vm, obj, env)?;
                    let key = index_key(vm, eval_expr(vm, idx, env)?)?;
                    let f = vm.get_prop_value(&target, &key, target.clone())?;
                    (f, target)
                }
                other => (eval_expr(vm, other, env)?, GuestValue::Undefined),
            };
            let mut argv = Vec::with_capacity(args.len());
            for a in args {
                argv.push(eval_expr(vm, a, env)?);
            }
            vm.call_value(&func, this, argv)
        }
        Expr::New(callee, args) => {
            let func = eval_expr(vm, callee, env)?;
            let mut argv = Vec::with_capacity(args.len());
            for a in args {
                argv.push(eval_expr(vm, a, env)?);
            }
            vm.construct_value(&func, argv)
        }
        Expr::ObjectLit(entries) => {
            let obj = vm.new_object_value();
            for (key, value) in entries {
                let v = eval_expr(vm, value, env)?;
                vm.set_prop_value(&obj, PropertyKey::string(key), v)?;
            }
            Ok(obj)
        }
        Expr::ArrayLit(items) => {
            let arr = object_ref(GuestObject::array());
            for item in items {
                let v = eval_expr(vm, item, env)?;
                arr.borrow_mut().push(v);
            }
            Ok(GuestValue::Object(arr))
        }
    }
}

fn index_key(_vm: &Vm, v: GuestValue) -> VmResult<PropertyKey> {
    match v {
        GuestValue::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => {
            Ok(PropertyKey::Index(n as u32))
        }
        GuestValue::Number(n) => Ok(PropertyKey::String(Rc::from(
            crate::value::format_number(n).as_str(),
        ))),
        GuestValue::String(s) => Ok(PropertyKey::String(s)),
        GuestValue::Symbol(s) => Ok(PropertyKey::Symbol(s)),
        other => Err(VmError::type_error(format!(
            "invalid property key: {}",
            other.type_of()
        ))),
    }
}

fn binary(op: BinOp, a: GuestValue, b: GuestValue) -> VmResult<GuestValue> {
    use GuestValue::{Bool, Number, String as Str};
    match op {
        BinOp::StrictEq | BinOp::Eq => Ok(Bool(a.same_value(&b))),
        BinOp::StrictNotEq | BinOp::NotEq => Ok(Bool(!a.same_value(&b))),
        BinOp::Add => match (&a, &b) {
            (Number(x), Number(y)) => Ok(Number(x + y)),
            (Str(_), _) | (_, Str(_)) => {
                Ok(Str(Rc::from(format!("{}{}", a.render(), b.render()).as_str())))
            }
            _ => Err(VmError::type_error("invalid operands to +")),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div => match (&a, &b) {
            (Number(x), Number(y)) => Ok(Number(match op {
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                _ => x / y,
            })),
            _ => Err(VmError::type_error("arithmetic on non-numbers")),
        },
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let ord = match (&a, &b) {
                (Number(x), Number(y)) => x.partial_cmp(y),
                (Str(x), Str(y)) => Some(x.cmp(y)),
                _ => return Err(VmError::type_error("comparison on mixed types")),
            };
            let Some(ord) = ord else {
                return Ok(Bool(false)); // NaN comparisons
            };
            Ok(Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Le => ord.is_le(),
                _ => ord.is_ge(),
            }))
        }
    }
}
