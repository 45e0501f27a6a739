//! Host objects: descriptor indexing, intrinsic metamethods and equality

use std::rc::Rc;

use ferrous_script::{
    CallbackFunction, OpCode, Processor, ProtoBuilder, ScriptError, ScriptResult, UserData,
    UserDataDescriptor, Value,
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec2 {
    x: f64,
    y: f64,
}

struct Vec2Type;

fn vec2(x: f64, y: f64) -> Value {
    Value::new_userdata(UserData::new(Vec2 { x, y }, Rc::new(Vec2Type)))
}

fn unpack(v: &Value) -> Option<Vec2> {
    match v {
        Value::UserData(ud) => ud.borrow::<Vec2>().map(|v| *v),
        _ => None,
    }
}

impl UserDataDescriptor for Vec2Type {
    fn name(&self) -> &str {
        "Vec2"
    }

    fn index(&self, obj: &UserData, key: &Value) -> ScriptResult<Option<Value>> {
        let v = match obj.borrow::<Vec2>() {
            Some(v) => *v,
            None => return Ok(None),
        };
        Ok(match key.as_str() {
            Some("x") => Some(Value::Number(v.x)),
            Some("y") => Some(Value::Number(v.y)),
            _ => None,
        })
    }

    fn set_index(&self, obj: &UserData, key: &Value, value: Value) -> ScriptResult<bool> {
        let n = match value.as_number() {
            Some(n) => n,
            None => return Err(ScriptError::runtime("Vec2 fields are numbers")),
        };
        let mut v = match obj.borrow_mut::<Vec2>() {
            Some(v) => v,
            None => return Ok(false),
        };
        match key.as_str() {
            Some("x") => v.x = n,
            Some("y") => v.y = n,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn meta_index(&self, _obj: &UserData, name: &str) -> Option<Value> {
        match name {
            "__add" => Some(Value::new_callback(CallbackFunction::new("Vec2.__add", |_ctx, args| {
                match (unpack(&args.get(0)), unpack(&args.get(1))) {
                    (Some(a), Some(b)) => Ok(vec2(a.x + b.x, a.y + b.y)),
                    _ => Err(ScriptError::runtime("Vec2 expected")),
                }
            }))),
            _ => None,
        }
    }

    fn equals(&self, a: &UserData, b: &UserData) -> bool {
        match (a.borrow::<Vec2>(), b.borrow::<Vec2>()) {
            (Some(a), Some(b)) => *a == *b,
            _ => false,
        }
    }
}

fn compile(p: &mut Processor, f: ProtoBuilder) -> ScriptResult<Value> {
    let mut chunk = ProtoBuilder::chunk("ud");
    chunk.begin_fn(0, false);
    chunk.closure(f.build());
    chunk.ret(1);
    let main = p.load(Rc::new(chunk.build()))?;
    p.call(&main, vec![])
}

#[test]
fn test_fields_read_and_write_through_descriptor() -> ScriptResult<()> {
    let mut p = Processor::default();
    // function(v) v.x = v.y * 2 return v.x end
    let mut f = ProtoBuilder::function("scale");
    let v = f.local("v");
    f.begin_fn(1, false);
    f.load(&v);
    f.index(Some("y"));
    f.push_number(2.0);
    f.op(OpCode::Mul);
    f.load(&v);
    f.index_set(Some("x"));
    f.load(&v);
    f.index(Some("x"));
    f.ret(1);
    let scale = compile(&mut p, f)?;

    let point = vec2(1.0, 4.0);
    assert_eq!(p.call(&scale, vec![point.clone()])?, Value::Number(8.0));
    assert_eq!(unpack(&point), Some(Vec2 { x: 8.0, y: 4.0 }));
    Ok(())
}

#[test]
fn test_unknown_member_errors_name_the_type() -> ScriptResult<()> {
    let mut p = Processor::default();
    let mut get = ProtoBuilder::function("get");
    let v = get.local("v");
    get.begin_fn(1, false);
    get.load(&v);
    get.index(Some("z"));
    get.ret(1);
    let get = compile(&mut p, get)?;

    let err = p.call(&get, vec![vec2(0.0, 0.0)]).unwrap_err();
    assert_eq!(err.to_string(), "cannot access field z of userdata<Vec2>");
    Ok(())
}

#[test]
fn test_intrinsic_add_and_delegated_equality() -> ScriptResult<()> {
    let mut p = Processor::default();
    let mut add = ProtoBuilder::function("add");
    let a = add.local("a");
    let b = add.local("b");
    add.begin_fn(2, false);
    add.load(&a);
    add.load(&b);
    add.op(OpCode::Add);
    add.ret(1);
    let add = compile(&mut p, add)?;

    let mut eq = ProtoBuilder::function("eq");
    let a = eq.local("a");
    let b = eq.local("b");
    eq.begin_fn(2, false);
    eq.load(&a);
    eq.load(&b);
    eq.op(OpCode::Eq);
    eq.ret(1);
    let eq = compile(&mut p, eq)?;

    let sum = p.call(&add, vec![vec2(1.0, 2.0), vec2(3.0, 4.0)])?;
    assert_eq!(unpack(&sum), Some(Vec2 { x: 4.0, y: 6.0 }));

    assert_eq!(p.call(&eq, vec![sum.clone(), vec2(4.0, 6.0)])?, Value::Boolean(true));
    assert_eq!(p.call(&eq, vec![sum, vec2(0.0, 6.0)])?, Value::Boolean(false));
    Ok(())
}
