//! End-to-end bridging scenarios driven through a VM session.

use std::cell::Cell;
use std::rc::Rc;

use variant_bridge::{
    LuaCallable, VmSession, WeaklyBoundCallable, is_sequence, push_callable, push_host_value, to_callable,
    to_host_value,
};
use variant_bridge_core::{
    Callable, CallableFn, Dictionary, HostObject, MessageCapture, ObjectDb, ObjectRef, Variant,
};
use variant_bridge_vm::{LibraryFlags, Thread, VmError, VmOptions};

fn new_session() -> (ObjectRef, Rc<VmSession>) {
    variant_bridge::initialize();
    let object = VmSession::new(VmOptions::default());
    let session = object.cast::<VmSession>().expect("session object");
    session.open_libs(LibraryFlags::ALL).expect("open libs");
    (object, session)
}

/// Run a script function and convert its first result.
fn run(session: &VmSession, script: impl Fn(&Thread) -> Result<usize, VmError> + 'static) -> Variant {
    let thread = session.thread().expect("open session");
    thread.push_function("script", script);
    thread.pcall(0, 1).expect("script should succeed");
    let value = to_host_value(&thread, -1);
    thread.pop(1);
    value
}

#[test]
fn test_map_round_trip() {
    let (_object, session) = new_session();
    let mut map = Dictionary::new();
    map.insert("name", "Alice");
    map.insert("count", 3);
    session.set_global("config", &Variant::from(map)).unwrap();

    let back = session.get_global("config");
    let back = back.as_dictionary().expect("a map");
    assert_eq!(back.len(), 2);
    assert_eq!(back.get(&Variant::from("name")), Some(&Variant::from("Alice")));
    assert_eq!(back.get(&Variant::from("count")), Some(&Variant::Int(3)));
}

#[test]
fn test_script_sequence_literal() {
    let (_object, session) = new_session();
    let value = run(&session, |t: &Thread| {
        t.create_table(3, 0);
        for (i, n) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            t.push_number(n);
            t.raw_set_i(-2, i as i64 + 1)?;
        }
        Ok(1)
    });
    assert_eq!(
        value,
        Variant::from(vec![Variant::Int(10), Variant::Int(20), Variant::Int(30)])
    );
}

#[test]
fn test_script_sparse_table_is_a_map() {
    let (_object, session) = new_session();
    let thread = session.thread().unwrap();
    thread.push_function("script", |t: &Thread| {
        t.new_table();
        t.push_string("a");
        t.raw_set_i(-2, 1)?;
        t.push_string("c");
        t.raw_set_i(-2, 3)?;
        Ok(1)
    });
    thread.pcall(0, 1).unwrap();
    assert!(!is_sequence(&thread, -1));
    let value = to_host_value(&thread, -1);
    let map = value.as_dictionary().expect("a map, not a sequence");
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&Variant::Int(1)), Some(&Variant::from("a")));
    assert_eq!(map.get(&Variant::Int(3)), Some(&Variant::from("c")));
}

#[test]
fn test_host_callable_called_repeatedly_keeps_stack_balanced() {
    let (_object, session) = new_session();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let g = Callable::from_custom(CallableFn::new("g", move |_: &[Variant]| {
        counter.set(counter.get() + 1);
        Ok(Variant::Int(42))
    }));
    session.set_global("g", &Variant::Callable(g)).unwrap();
    session
        .load_function("script", |t: &Thread| {
            t.get_global("g")?;
            t.call(0, 1)?;
            Ok(1)
        })
        .unwrap();

    let thread = session.thread().unwrap();
    let top = thread.get_top();
    for _ in 0..100 {
        assert_eq!(session.call_function("script", &[]), Ok(Variant::Int(42)));
        assert_eq!(thread.get_top(), top);
    }
    assert_eq!(calls.get(), 100);
}

#[test]
fn test_weakly_bound_callable_after_object_destroyed() {
    struct Target;
    impl HostObject for Target {
        fn class_name(&self) -> &str {
            "Target"
        }
    }

    let (_object, session) = new_session();
    let target = ObjectDb::instantiate(Target);
    let id = target.id();
    let describe = Callable::from_custom(CallableFn::new("describe", |args: &[Variant]| {
        Ok(Variant::from(args[0].type_name()))
    }));
    let bound = WeaklyBoundCallable::bind(describe, id);
    session.set_global("describe", &Variant::Callable(bound)).unwrap();
    session
        .load_function("script", |t: &Thread| {
            t.get_global("describe")?;
            t.call(0, 1)?;
            Ok(1)
        })
        .unwrap();

    assert_eq!(session.call_function("script", &[]), Ok(Variant::from("Object")));
    drop(target);
    assert!(!ObjectDb::is_alive(id));
    assert_eq!(session.call_function("script", &[]), Ok(Variant::from("Nil")));
}

#[test]
fn test_vm_closure_identity_across_wrappers() {
    let (object, session) = new_session();
    let thread = session.thread().unwrap();
    thread.push_function("f", |_: &Thread| Ok(0));
    thread.push_function("h", |_: &Thread| Ok(0));
    let a = to_callable(&thread, 1).unwrap();
    let b = to_callable(&thread, 1).unwrap();
    let c = to_callable(&thread, 2).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.hash_value(), b.hash_value());
    assert_ne!(a, c);
    let lua = a.custom_as::<LuaCallable>().unwrap();
    assert_eq!(a.object_id(), object.id());
    assert_eq!(lua.name(), "f");
}

#[test]
fn test_vm_closure_survives_round_trips_without_nesting() {
    let (_object, session) = new_session();
    session
        .load_function("inc", |t: &Thread| {
            let n = t.check_number(1)?;
            t.push_number(n + 1.0);
            Ok(1)
        })
        .unwrap();
    let mut value = session.get_global("inc");
    let thread = session.thread().unwrap();
    for _ in 0..10 {
        push_host_value(&thread, &value).unwrap();
        assert!(thread.is_function(-1));
        value = to_host_value(&thread, -1);
        thread.pop(1);
    }
    let callable = value.as_callable().unwrap();
    assert_eq!(callable.call(&[Variant::Int(1)]), Ok(Variant::Int(2)));
}

#[test]
fn test_closed_session_invalidates_wrapped_closures() {
    let (object, session) = new_session();
    session.load_function("f", |_: &Thread| Ok(0)).unwrap();
    let f = session.get_global("f");
    let callable = f.as_callable().unwrap().clone();
    assert!(callable.is_valid());
    drop(session);
    drop(object);
    assert!(!callable.is_valid());
    let capture = MessageCapture::start();
    assert!(callable.call(&[]).is_err());
    assert!(capture.is_empty());
}

#[test]
fn test_script_errors_inside_host_calls_are_catchable() {
    let (_object, session) = new_session();
    let strict = Callable::from_custom(CallableFn::with_arity("strict", 2, |_: &[Variant]| Ok(Variant::Nil)));
    let thread = session.thread().unwrap();
    push_callable(&thread, &strict).unwrap();
    thread.push_number(1.0);
    let err = thread.pcall(1, 0).unwrap_err();
    assert!(err.to_string().contains("too few arguments"));
    assert_eq!(thread.get_top(), 1);
    thread.pop(1);
    assert!(session.is_valid());
}
