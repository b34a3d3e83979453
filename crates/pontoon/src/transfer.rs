//! Own-property descriptor transfer
//!
//! Both engines share this module so descriptor fidelity (attributes,
//! accessor pairs, symbol keys) is guaranteed identically in both
//! directions. Only own properties are copied; inherited ones travel
//! with the prototype.

use pontoon_vm::{GuestHandle, GuestPropertyDescriptor, PropertyKey};
use std::cell::RefCell;
use std::rc::Rc;

use crate::arena::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostDescriptor, HostKey, HostObject, HostValue};
use crate::identity::IdentityMap;
use crate::marshal::marshal;
use crate::unmarshal::unmarshal;
use crate::util::OwnedHandles;

pub(crate) fn guest_key(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    key: &HostKey,
) -> BridgeResult<PropertyKey> {
    match key {
        HostKey::String(s) => Ok(PropertyKey::String(s.clone())),
        HostKey::Index(i) => Ok(PropertyKey::Index(*i)),
        HostKey::Symbol(s) => {
            let h = marshal(core, scratch, &HostValue::Symbol(s.clone()))?;
            let k = core.vm.prop_key(h);
            core.vm.release(h);
            Ok(k?)
        }
    }
}

pub(crate) fn host_key(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    key: &PropertyKey,
) -> BridgeResult<HostKey> {
    match key {
        PropertyKey::String(s) => Ok(HostKey::String(s.clone())),
        PropertyKey::Index(i) => Ok(HostKey::Index(*i)),
        PropertyKey::Symbol(_) => {
            let h = core.vm.key_handle(key);
            let v = unmarshal(core, scratch, h);
            core.vm.release(h);
            match v? {
                HostValue::Symbol(s) => Ok(HostKey::Symbol(s)),
                _ => Err(BridgeError::host("symbol key lost its identity")),
            }
        }
    }
}

/// Copy every own descriptor of `src` onto the guest mirror `dst`
pub(crate) fn host_to_guest(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    src: &HostObject,
    dst: GuestHandle,
) -> BridgeResult<()> {
    for key in src.own_keys() {
        let Some(desc) = src.own_descriptor(&key) else {
            continue;
        };
        let pkey = guest_key(core, scratch, &key)?;
        let mut temps = OwnedHandles::new(core.vm.clone());
        let gd = match desc {
            HostDescriptor::Data { value, attributes } => GuestPropertyDescriptor {
                value: Some(temps.push(marshal(core, scratch, &value)?)),
                get: None,
                set: None,
                attributes,
            },
            HostDescriptor::Accessor {
                get,
                set,
                attributes,
            } => GuestPropertyDescriptor {
                value: None,
                get: get
                    .map(|g| marshal(core, scratch, &g))
                    .transpose()?
                    .map(|h| temps.push(h)),
                set: set
                    .map(|s| marshal(core, scratch, &s))
                    .transpose()?
                    .map(|h| temps.push(h)),
                attributes,
            },
        };
        core.vm.define_prop(dst, pkey, &gd)?;
    }
    Ok(())
}

/// Copy every own descriptor of the guest value `src` onto `dst`
pub(crate) fn guest_to_host(
    core: &Rc<Core>,
    scratch: &RefCell<IdentityMap>,
    src: GuestHandle,
    dst: &HostObject,
) -> BridgeResult<()> {
    for key in core.vm.own_keys(src)? {
        let Some(gd) = core.vm.own_descriptor(src, &key)? else {
            continue;
        };
        let mut temps = OwnedHandles::new(core.vm.clone());
        if let Some(h) = gd.value {
            temps.push(h);
        }
        if let Some(h) = gd.get {
            temps.push(h);
        }
        if let Some(h) = gd.set {
            temps.push(h);
        }
        let hkey = host_key(core, scratch, &key)?;
        let desc = if gd.get.is_some() || gd.set.is_some() {
            HostDescriptor::Accessor {
                get: gd
                    .get
                    .map(|h| unmarshal(core, scratch, h))
                    .transpose()?,
                set: gd
                    .set
                    .map(|h| unmarshal(core, scratch, h))
                    .transpose()?,
                attributes: gd.attributes,
            }
        } else {
            HostDescriptor::Data {
                value: match gd.value {
                    Some(h) => unmarshal(core, scratch, h)?,
                    None => HostValue::Undefined,
                },
                attributes: gd.attributes,
            }
        };
        dst.define(hkey, desc);
    }
    Ok(())
}
