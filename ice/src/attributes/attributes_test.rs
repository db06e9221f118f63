use stun::attributes::*;
use stun::message::*;

use super::control::*;
use super::priority::*;
use super::use_candidate::*;
use crate::error::Result;

#[test]
fn test_controlled_get_from() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControlled(4321);
    let result = c.get_from(&m);
    assert_eq!(result, Err(stun::Error::ErrAttributeNotFound));

    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut c1 = AttrControlled::default();
    c1.get_from(&m1)?;
    assert_eq!(c1, c, "not equal");

    // Bad length.
    let mut m3 = Message::new();
    m3.add(ATTR_ICE_CONTROLLED, &[0; 100]);
    let mut c2 = AttrControlled::default();
    let result = c2.get_from(&m3);
    assert_eq!(result, Err(stun::Error::ErrAttributeSizeInvalid));

    Ok(())
}

#[test]
fn test_controlling_get_from() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControlling(4321);
    let result = c.get_from(&m);
    assert_eq!(result, Err(stun::Error::ErrAttributeNotFound));

    m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut c1 = AttrControlling::default();
    c1.get_from(&m1)?;
    assert_eq!(c1, c, "not equal");

    let mut m3 = Message::new();
    m3.add(ATTR_ICE_CONTROLLING, &[0; 100]);
    let mut c2 = AttrControlling::default();
    let result = c2.get_from(&m3);
    assert_eq!(result, Err(stun::Error::ErrAttributeSizeInvalid));

    Ok(())
}

#[test]
fn test_control_get_from() -> Result<()> {
    let mut m = Message::new();
    let mut c = AttrControl::default();
    let result = c.get_from(&m);
    assert_eq!(result, Err(stun::Error::ErrAttributeNotFound));

    for role in [Role::Controlled, Role::Controlling] {
        let c = AttrControl::new(role, 4321);
        let mut m = Message::new();
        m.build(&[Box::new(BINDING_REQUEST), Box::new(c)])?;

        let mut m1 = Message::new();
        m1.write(&m.raw)?;

        let mut c1 = AttrControl::default();
        c1.get_from(&m1)?;
        assert_eq!(c1.role(), role);
        assert_eq!(c1.tie_breaker(), 4321);
    }

    m.add(ATTR_ICE_CONTROLLING, &[0; 3]);
    let result = c.get_from(&m);
    assert_eq!(result, Err(stun::Error::ErrAttributeSizeInvalid));

    Ok(())
}

#[test]
fn test_role_string() -> Result<()> {
    assert_eq!(Role::from("controlling"), Role::Controlling);
    assert_eq!(Role::from("controlled"), Role::Controlled);
    assert_eq!(Role::from("boss"), Role::Unspecified);
    assert_eq!(Role::Controlling.to_string(), "controlling");
    assert_eq!(Role::default().to_string(), "unspecified");

    Ok(())
}

#[test]
fn test_priority_get_from() -> Result<()> {
    let mut m = Message::new();
    let mut p = PriorityAttr::default();
    let result = p.get_from(&m);
    assert_eq!(result, Err(stun::Error::ErrAttributeNotFound));

    m.build(&[Box::new(BINDING_REQUEST), Box::new(PriorityAttr(2_130_706_431))])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut p1 = PriorityAttr::default();
    p1.get_from(&m1)?;
    assert_eq!(p1, PriorityAttr(2_130_706_431));

    let mut m3 = Message::new();
    m3.add(ATTR_PRIORITY, &[0; 100]);
    let mut p2 = PriorityAttr::default();
    let result = p2.get_from(&m3);
    assert_eq!(result, Err(stun::Error::ErrAttributeSizeInvalid));

    Ok(())
}

#[test]
fn test_use_candidate_attr_add_to() -> Result<()> {
    let mut m = Message::new();
    assert!(!UseCandidateAttr::is_set(&m), "should not be set");

    m.build(&[Box::new(BINDING_REQUEST), Box::new(UseCandidateAttr::new())])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    assert!(UseCandidateAttr::is_set(&m1), "should be set");

    Ok(())
}
