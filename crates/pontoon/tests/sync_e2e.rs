//! Live synchronization and promise-bridging tests: write disciplines,
//! `__proto__` rejection, the in-flight escalation during cross-boundary
//! calls, and job-queue pumping.

use std::cell::RefCell;
use std::rc::Rc;

use pontoon::{
    Arena, HostKey, HostObject, HostPromise, HostValue, Options, PropertyKey, SyncMode, Vm,
};

fn arena() -> Arena {
    Arena::new(Vm::new(), Options::default()).unwrap()
}

fn num(v: &HostValue) -> f64 {
    match v {
        HostValue::Number(n) => *n,
        other => panic!("expected number, got {other:?}"),
    }
}

fn synced(mode: SyncMode) -> (Arena, HostObject, HostValue) {
    let arena = arena();
    let obj = HostObject::new();
    obj.set(HostKey::string("a"), HostValue::Number(1.0)).unwrap();
    let hv = HostValue::Object(obj.clone());
    let wrapped = arena.sync_with(&hv, mode).unwrap();
    arena.expose([("o".to_string(), hv)]).unwrap();
    (arena, obj, wrapped)
}

#[test]
fn test_both_host_write_reaches_guest() {
    let (arena, obj, wrapped) = synced(SyncMode::Both);
    wrapped
        .as_object()
        .unwrap()
        .set(HostKey::string("a"), HostValue::Number(2.0))
        .unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("a")).unwrap()), 2.0);
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 2.0);
}

#[test]
fn test_both_guest_write_reaches_host() {
    let (arena, obj, _wrapped) = synced(SyncMode::Both);
    arena.eval_code("o.a = 2").unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("a")).unwrap()), 2.0);
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 2.0);
}

#[test]
fn test_both_guest_delete_reaches_host() {
    let (arena, obj, _wrapped) = synced(SyncMode::Both);
    let vm = arena.vm();
    let oh = vm.get_prop(vm.global(), &PropertyKey::string("o")).unwrap();
    assert!(vm.delete_prop(oh, &PropertyKey::string("a")).unwrap());
    assert!(!obj.has_own(&HostKey::string("a")));
    assert!(arena.eval_code("o.a").unwrap().is_undefined());
}

#[test]
fn test_vm_discipline_keeps_guest_authoritative() {
    let (arena, obj, wrapped) = synced(SyncMode::Vm);

    // host-side writes replay into the guest without touching the host copy
    wrapped
        .as_object()
        .unwrap()
        .set(HostKey::string("a"), HostValue::Number(2.0))
        .unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("a")).unwrap()), 1.0);
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 2.0);

    // guest-side writes stay local
    arena.eval_code("o.b = 5").unwrap();
    assert_eq!(num(&arena.eval_code("o.b").unwrap()), 5.0);
    assert!(!obj.has_own(&HostKey::string("b")));
}

#[test]
fn test_host_discipline_keeps_host_authoritative() {
    let (arena, obj, wrapped) = synced(SyncMode::Host);

    // host-side writes stay local
    wrapped
        .as_object()
        .unwrap()
        .set(HostKey::string("a"), HostValue::Number(2.0))
        .unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("a")).unwrap()), 2.0);
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 1.0);

    // guest-side writes replay into the host without touching the guest copy
    arena.eval_code("o.c = 3").unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("c")).unwrap()), 3.0);
    assert!(arena.eval_code("o.c").unwrap().is_undefined());
}

#[test]
fn test_proto_write_rejected_in_guest() {
    let (arena, obj, _wrapped) = synced(SyncMode::Both);
    arena.eval_code("o.__proto__ = {evil: 1}").unwrap();
    assert!(obj.proto().is_none());
    let vm = arena.vm();
    let oh = vm.get_prop(vm.global(), &PropertyKey::string("o")).unwrap();
    let raw = vm.proxy_target(oh).unwrap().unwrap();
    assert!(vm.custom_proto_of(raw).unwrap().is_none());
}

#[test]
fn test_proto_write_rejected_in_host() {
    let (_arena, obj, wrapped) = synced(SyncMode::Both);
    let ok = wrapped
        .as_object()
        .unwrap()
        .set(
            HostKey::string("__proto__"),
            HostValue::Object(HostObject::new()),
        )
        .unwrap();
    assert!(!ok);
    assert!(obj.proto().is_none());
}

#[test]
fn test_unsync_stops_propagation() {
    let (arena, obj, wrapped) = synced(SyncMode::Both);
    let hv = HostValue::Object(obj.clone());
    arena.unsync(&hv);

    wrapped
        .as_object()
        .unwrap()
        .set(HostKey::string("a"), HostValue::Number(2.0))
        .unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("a")).unwrap()), 2.0);
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 1.0);
}

#[test]
fn test_in_flight_call_escalates_to_both() {
    let arena = arena();
    let obj = HostObject::new();
    let m = HostObject::function(
        "m",
        Rc::new(|this, _| {
            if let HostValue::Object(o) = &this {
                o.set(HostKey::string("hit"), HostValue::Number(1.0))?;
            }
            Ok(HostValue::Undefined)
        }),
    );
    obj.set(HostKey::string("m"), HostValue::Object(m)).unwrap();
    let hv = HostValue::Object(obj.clone());
    let wrapped = arena.sync_with(&hv, SyncMode::Host).unwrap();
    arena.expose([("o".to_string(), hv)]).unwrap();

    // under the host discipline a host-side write normally stays local
    wrapped
        .as_object()
        .unwrap()
        .set(HostKey::string("cold"), HostValue::Number(1.0))
        .unwrap();
    assert!(arena.eval_code("o.cold").unwrap().is_undefined());

    // but a write to `this` during a guest-initiated call reaches both sides
    arena.eval_code("o.m()").unwrap();
    assert_eq!(num(&obj.get(&HostKey::string("hit")).unwrap()), 1.0);
    assert_eq!(num(&arena.eval_code("o.hit").unwrap()), 1.0);
}

#[test]
fn test_promise_resolution_reaches_guest_after_drain() {
    let arena = arena();
    let p = HostPromise::deferred();
    arena
        .expose([("p".to_string(), HostValue::Promise(p.clone()))])
        .unwrap();
    arena
        .eval_code("got = 0; p.then((v) => got = v)")
        .unwrap();

    p.resolve(HostValue::Number(7.0)).unwrap();
    // the continuation is queued, not run inline
    assert_eq!(num(&arena.eval_code("got").unwrap()), 0.0);
    let ran = arena.execute_pending_jobs(None).unwrap();
    assert!(ran >= 1);
    assert_eq!(num(&arena.eval_code("got").unwrap()), 7.0);
    assert_eq!(arena.execute_pending_jobs(None).unwrap(), 0);
}

#[test]
fn test_promise_rejection_reaches_guest() {
    let arena = arena();
    let p = HostPromise::deferred();
    arena
        .expose([("p".to_string(), HostValue::Promise(p.clone()))])
        .unwrap();
    arena
        .eval_code("got = 0; p.then(undefined, (e) => got = e)")
        .unwrap();

    p.reject(HostValue::String("bad".into())).unwrap();
    arena.execute_pending_jobs(None).unwrap();
    match arena.eval_code("got").unwrap() {
        HostValue::String(s) => assert_eq!(&*s, "bad"),
        other => panic!("expected string, got {other:?}"),
    }
}

#[test]
fn test_guest_promise_settles_host_side() {
    let arena = arena();
    let v = arena.eval_code("Promise.resolve(42)").unwrap();
    let HostValue::Promise(p) = v else {
        panic!("expected a promise");
    };
    assert!(p.is_pending());
    arena.execute_pending_jobs(None).unwrap();
    assert!(!p.is_pending());

    let got = Rc::new(RefCell::new(None));
    let sink = got.clone();
    p.then(
        Some(Rc::new(move |v: &HostValue| {
            *sink.borrow_mut() = Some(v.clone());
            Ok(())
        })),
        None,
    )
    .unwrap();
    assert_eq!(num(got.borrow().as_ref().unwrap()), 42.0);
}

#[test]
fn test_guest_rejection_settles_host_side() {
    let arena = arena();
    let v = arena.eval_code("Promise.reject(\"no\")").unwrap();
    let HostValue::Promise(p) = v else {
        panic!("expected a promise");
    };
    arena.execute_pending_jobs(None).unwrap();
    assert!(!p.is_pending());

    let got = Rc::new(RefCell::new(None));
    let sink = got.clone();
    p.then(
        None,
        Some(Rc::new(move |v: &HostValue| {
            *sink.borrow_mut() = Some(v.clone());
            Ok(())
        })),
    )
    .unwrap();
    match got.borrow().as_ref().unwrap() {
        HostValue::String(s) => assert_eq!(&**s, "no"),
        other => panic!("expected string, got {other:?}"),
    }
}
