//! End-to-end marshaling tests: identity, cycles, descriptors, classes,
//! exceptions and marshaling policies, all through the public [`Arena`]
//! surface.

use std::rc::Rc;

use pontoon::{
    Arena, BridgeError, GuestPropertyDescriptor, HostDescriptor, HostKey, HostObject, HostSymbol,
    HostValue, Marshalable, Options, PropertyAttributes, PropertyKey, Registration, Vm,
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

#[test]
fn test_expose_then_eval_preserves_identity() {
    let arena = arena();
    let obj = HostObject::new();
    obj.set(HostKey::string("a"), HostValue::Number(1.0)).unwrap();
    let hv = HostValue::Object(obj);

    arena.expose([("o".to_string(), hv.clone())]).unwrap();
    let back = arena.eval_code("o").unwrap();
    assert!(back.same_value(&hv));
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 1.0);
}

#[test]
fn test_marshal_is_idempotent() {
    let arena = arena();
    let hv = HostValue::Object(HostObject::new());
    arena
        .expose([("a".to_string(), hv.clone()), ("b".to_string(), hv)])
        .unwrap();
    let eq = arena.eval_code("a === b").unwrap();
    assert!(matches!(eq, HostValue::Bool(true)));
}

#[test]
fn test_cyclic_object_host_to_guest() {
    let arena = arena();
    let obj = HostObject::new();
    let hv = HostValue::Object(obj.clone());
    obj.set(HostKey::string("me"), hv.clone()).unwrap();

    arena.expose([("o".to_string(), hv)]).unwrap();
    let eq = arena.eval_code("o.me === o").unwrap();
    assert!(matches!(eq, HostValue::Bool(true)));
}

#[test]
fn test_cyclic_object_guest_to_host() {
    let arena = arena();
    let v = arena.eval_code("a = {}; a.me = a; a").unwrap();
    let obj = v.as_object().unwrap();
    let me = obj.get(&HostKey::string("me")).unwrap();
    assert!(me.same_value(&v));
}

#[test]
fn test_array_both_directions() {
    let arena = arena();
    let arr = HostObject::array();
    arr.push(HostValue::Number(1.0));
    arr.push(HostValue::Number(2.0));
    arena
        .expose([("arr".to_string(), HostValue::Object(arr))])
        .unwrap();
    assert_eq!(num(&arena.eval_code("arr.length").unwrap()), 2.0);
    assert_eq!(num(&arena.eval_code("arr[1]").unwrap()), 2.0);

    let v = arena.eval_code("[1, 2, 3]").unwrap();
    let obj = v.as_object().unwrap();
    assert!(obj.is_array());
    assert_eq!(num(&obj.get(&HostKey::Index(2)).unwrap()), 3.0);
}

#[test]
fn test_descriptor_fidelity_host_to_guest() {
    let arena = arena();
    let obj = HostObject::new();
    obj.define(
        HostKey::string("k"),
        HostDescriptor::Data {
            value: HostValue::Number(1.0),
            attributes: PropertyAttributes {
                writable: false,
                enumerable: false,
                configurable: true,
            },
        },
    );
    arena
        .expose([("o".to_string(), HostValue::Object(obj))])
        .unwrap();

    let vm = arena.vm();
    let g = vm.global();
    let oh = vm.get_prop(g, &PropertyKey::string("o")).unwrap();
    let desc = vm
        .own_descriptor(oh, &PropertyKey::string("k"))
        .unwrap()
        .expect("property should exist on the mirror");
    assert!(!desc.attributes.writable);
    assert!(!desc.attributes.enumerable);
    assert!(desc.attributes.configurable);
    let value = desc.value.expect("data descriptor");
    assert_eq!(vm.as_number(value).unwrap(), Some(1.0));
}

#[test]
fn test_descriptor_fidelity_guest_to_host() {
    let arena = arena();
    let vm = arena.vm();
    let h = vm.new_object();
    let one = vm.new_number(1.0);
    vm.define_prop(
        h,
        PropertyKey::string("k"),
        &GuestPropertyDescriptor {
            value: Some(one),
            get: None,
            set: None,
            attributes: PropertyAttributes {
                writable: false,
                enumerable: false,
                configurable: true,
            },
        },
    )
    .unwrap();
    vm.set_global("x", h).unwrap();

    let v = arena.eval_code("x").unwrap();
    let obj = v.as_object().unwrap();
    match obj.own_descriptor(&HostKey::string("k")).unwrap() {
        HostDescriptor::Data { value, attributes } => {
            assert_eq!(num(&value), 1.0);
            assert!(!attributes.writable);
            assert!(!attributes.enumerable);
            assert!(attributes.configurable);
        }
        HostDescriptor::Accessor { .. } => panic!("expected data descriptor"),
    }
}

#[test]
fn test_host_class_constructed_in_guest() {
    let arena = arena();
    let class = HostObject::class_constructor(
        "Point",
        Rc::new(|this, args| {
            if let HostValue::Object(o) = &this {
                o.set(
                    HostKey::string("x"),
                    args.first().cloned().unwrap_or(HostValue::Undefined),
                )?;
                o.set(
                    HostKey::string("y"),
                    args.get(1).cloned().unwrap_or(HostValue::Undefined),
                )?;
            }
            Ok(HostValue::Undefined)
        }),
    );
    let proto = match class.get(&HostKey::string("prototype")).unwrap() {
        HostValue::Object(p) => p,
        other => panic!("prototype should be an object, got {other:?}"),
    };
    proto
        .set(
            HostKey::string("mag2"),
            HostValue::Object(HostObject::function(
                "mag2",
                Rc::new(|this, _| {
                    let HostValue::Object(o) = &this else {
                        return Ok(HostValue::Undefined);
                    };
                    let x = match o.get(&HostKey::string("x"))? {
                        HostValue::Number(n) => n,
                        _ => 0.0,
                    };
                    let y = match o.get(&HostKey::string("y"))? {
                        HostValue::Number(n) => n,
                        _ => 0.0,
                    };
                    Ok(HostValue::Number(x * x + y * y))
                }),
            )),
        )
        .unwrap();

    arena
        .expose([("Point".to_string(), HostValue::Object(class))])
        .unwrap();
    assert_eq!(
        num(&arena.eval_code("pt = new Point(3, 4); pt.x").unwrap()),
        3.0
    );
    assert_eq!(num(&arena.eval_code("pt.mag2()").unwrap()), 25.0);

    let vm = arena.vm();
    let g = vm.global();
    let pt = vm.get_prop(g, &PropertyKey::string("pt")).unwrap();
    let ctor = vm.get_prop(g, &PropertyKey::string("Point")).unwrap();
    assert!(vm.instance_of(pt, ctor).unwrap());
}

#[test]
fn test_host_accessor_reaches_guest() {
    let arena = arena();
    let obj = HostObject::new();
    obj.define(
        HostKey::string("len"),
        HostDescriptor::Accessor {
            get: Some(HostValue::Object(HostObject::function(
                "",
                Rc::new(|this, _| {
                    let HostValue::Object(o) = &this else {
                        return Ok(HostValue::Undefined);
                    };
                    o.get(&HostKey::string("x"))
                }),
            ))),
            set: Some(HostValue::Object(HostObject::function(
                "",
                Rc::new(|this, args| {
                    if let HostValue::Object(o) = &this {
                        o.set(
                            HostKey::string("x"),
                            args.first().cloned().unwrap_or(HostValue::Undefined),
                        )?;
                    }
                    Ok(HostValue::Undefined)
                }),
            ))),
            attributes: PropertyAttributes::data(),
        },
    );
    obj.set(HostKey::string("x"), HostValue::Number(3.0)).unwrap();

    arena
        .expose([("o".to_string(), HostValue::Object(obj.clone()))])
        .unwrap();
    assert_eq!(num(&arena.eval_code("o.len").unwrap()), 3.0);
    assert_eq!(num(&arena.eval_code("o.len = 9; o.len").unwrap()), 9.0);
    // The setter ran against the original host object, not a copy
    assert_eq!(num(&obj.get(&HostKey::string("x")).unwrap()), 9.0);
}

// The bridge must keep exposed host objects alive itself: after the
// caller's only reference moves into `expose`, guest-side method calls
// still have to reach the one mapped host object.
#[test]
fn test_exposed_host_object_outlives_caller_reference() {
    let arena = arena();
    {
        let obj = HostObject::new();
        obj.set(HostKey::string("x"), HostValue::Number(3.0)).unwrap();
        obj.set(
            HostKey::string("bump"),
            HostValue::Object(HostObject::function(
                "bump",
                Rc::new(|this, _| {
                    let HostValue::Object(o) = &this else {
                        return Ok(HostValue::Undefined);
                    };
                    let n = match o.get(&HostKey::string("x"))? {
                        HostValue::Number(n) => n,
                        _ => 0.0,
                    };
                    o.set(HostKey::string("x"), HostValue::Number(n + 1.0))?;
                    o.get(&HostKey::string("x"))
                }),
            )),
        )
        .unwrap();
        arena
            .expose([("o".to_string(), HostValue::Object(obj))])
            .unwrap();
    }
    // Each call sees the previous call's write
    assert_eq!(num(&arena.eval_code("o.bump()").unwrap()), 4.0);
    assert_eq!(num(&arena.eval_code("o.bump()").unwrap()), 5.0);
}

#[test]
fn test_guest_function_callable_from_host() {
    let arena = arena();
    let v = arena.eval_code("f = (x) => x + 1; f").unwrap();
    let f = v.as_object().unwrap();
    assert!(f.is_callable());
    let r = f.call(HostValue::Undefined, &[HostValue::Number(41.0)]).unwrap();
    assert_eq!(num(&r), 42.0);
}

#[test]
fn test_guest_constructor_from_host() {
    let arena = arena();
    let v = arena.eval_code("Error").unwrap();
    let ctor = v.as_object().unwrap();
    let instance = ctor.construct(&[HostValue::String("boom".into())]).unwrap();
    let obj = instance.as_object().unwrap();
    assert!(obj.is_error());
    match obj.get(&HostKey::string("message")).unwrap() {
        HostValue::String(s) => assert_eq!(&*s, "boom"),
        other => panic!("expected message string, got {other:?}"),
    }
}

#[test]
fn test_host_exception_keeps_identity() {
    let arena = arena();
    let boom = HostValue::Object(HostObject::error("boom"));
    let thrown = boom.clone();
    let f = HostObject::function(
        "f",
        Rc::new(move |_, _| Err(BridgeError::exception(thrown.clone()))),
    );
    arena
        .expose([("f".to_string(), HostValue::Object(f))])
        .unwrap();

    let err = arena.eval_code("f()").unwrap_err();
    match err {
        BridgeError::Exception { value, .. } => assert!(value.same_value(&boom)),
        other => panic!("expected an exception, got {other}"),
    }
}

#[test]
fn test_guest_throw_surfaces_value() {
    let arena = arena();
    let err = arena.eval_code("throw {code: 7}").unwrap_err();
    match err {
        BridgeError::Exception { value, .. } => {
            let obj = value.as_object().unwrap();
            assert_eq!(num(&obj.get(&HostKey::string("code")).unwrap()), 7.0);
        }
        other => panic!("expected an exception, got {other}"),
    }
}

#[test]
fn test_symbol_identity_round_trip() {
    let arena = arena();
    let sym = HostValue::Symbol(HostSymbol::new(Some("marker")));
    arena.expose([("sym".to_string(), sym.clone())]).unwrap();
    let back = arena.eval_code("sym").unwrap();
    assert!(back.same_value(&sym));
}

#[test]
fn test_registered_pair_wins_over_mirroring() {
    let arena = arena();
    let hv = HostValue::Object(HostObject::new());
    arena
        .register(&hv, Registration::Source("reg = {a: 1}; reg".to_string()))
        .unwrap();

    let back = arena.eval_code("reg").unwrap();
    assert!(back.same_value(&hv));
    arena.expose([("o".to_string(), hv)]).unwrap();
    let eq = arena.eval_code("o === reg").unwrap();
    assert!(matches!(eq, HostValue::Bool(true)));
}

#[test]
fn test_register_collision_is_rejected() {
    let arena = arena();
    let vm = arena.vm();
    let hv = HostValue::Object(HostObject::new());
    let h1 = vm.new_object();
    arena.register(&hv, Registration::Handle(h1)).unwrap();

    let h2 = vm.new_object();
    let err = arena.register(&hv, Registration::Handle(h2)).unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyRegistered));

    // the original binding survives the failed attempt
    arena.expose([("o".to_string(), hv)]).unwrap();
    let oh = vm.get_prop(vm.global(), &PropertyKey::string("o")).unwrap();
    assert!(vm.same_value(oh, h1).unwrap());
}

#[test]
fn test_register_foreign_vm_handle_is_rejected() {
    let arena = arena();
    let other = Vm::new();
    let foreign = other.new_object();
    let hv = HostValue::Object(HostObject::new());
    let err = arena.register(&hv, Registration::Handle(foreign)).unwrap_err();
    assert!(matches!(err, BridgeError::VmMismatch));
}

#[test]
fn test_unregister_restores_mirroring() {
    let arena = arena();
    let vm = arena.vm();
    let hv = HostValue::Object(HostObject::new());
    let h = vm.new_object();
    arena.register(&hv, Registration::Handle(h)).unwrap();
    arena.unregister(&hv);

    arena.expose([("o".to_string(), hv)]).unwrap();
    let oh = vm.get_prop(vm.global(), &PropertyKey::string("o")).unwrap();
    assert!(!vm.same_value(oh, h).unwrap());
}

#[test]
fn test_json_policy_copies_without_identity() {
    let copied = HostObject::new();
    copied.set(HostKey::string("a"), HostValue::Number(1.0)).unwrap();
    let target = copied.clone();
    let options = Options {
        is_marshalable: Some(Rc::new(move |v| match v.as_object() {
            Some(o) if o.same(&target) => Marshalable::Json,
            _ => Marshalable::Reference,
        })),
        ..Default::default()
    };
    let arena = Arena::new(Vm::new(), options).unwrap();
    let hv = HostValue::Object(copied);

    arena.expose([("o".to_string(), hv.clone())]).unwrap();
    assert_eq!(num(&arena.eval_code("o.a").unwrap()), 1.0);
    let back = arena.eval_code("o").unwrap();
    assert!(!back.same_value(&hv));
}

#[test]
fn test_deny_policy_yields_undefined() {
    let denied = HostObject::new();
    let target = denied.clone();
    let options = Options {
        is_marshalable: Some(Rc::new(move |v| match v.as_object() {
            Some(o) if o.same(&target) => Marshalable::Deny,
            _ => Marshalable::Reference,
        })),
        ..Default::default()
    };
    let arena = Arena::new(Vm::new(), options).unwrap();

    arena
        .expose([("o".to_string(), HostValue::Object(denied))])
        .unwrap();
    assert!(arena.eval_code("o").unwrap().is_undefined());
}

#[test]
fn test_dispose_blocks_further_use() {
    let arena = arena();
    arena.expose([("o".to_string(), HostValue::Object(HostObject::new()))]).unwrap();
    arena.dispose();
    assert!(matches!(arena.eval_code("1"), Err(BridgeError::Disposed)));
    // disposing again is a no-op
    arena.dispose();
}
