//! Shared test helpers for integration tests

use cinnabar::context::CompileContext;
use cinnabar::heap::{InstanceType, NameId, ObjectRef, ShapeId, Value};
use cinnabar::masm::conv;
use cinnabar::masm::sim::{Outcome, Simulator};

/// Build a shape with the given in-object slot count and named fields.
pub fn shape_with_fields(
    ctx: &mut CompileContext,
    inobject: u32,
    fields: &[&str],
) -> (ShapeId, Vec<NameId>) {
    let mut shape = ctx.heap.new_shape(InstanceType::Object, inobject);
    let mut names = Vec::new();
    for field in fields {
        let name = ctx.heap.names.intern(field);
        shape = ctx.heap.transition_add_field(shape, name);
        names.push(name);
    }
    (shape, names)
}

/// Run a load stub against a receiver and return the result value.
pub fn run_load_stub(
    ctx: &mut CompileContext,
    code: cinnabar::code::CodeHandle,
    receiver: ObjectRef,
    name: NameId,
) -> Value {
    let mut sim = Simulator::new(ctx);
    sim.state.set_reg(conv::RECEIVER, Value::Object(receiver));
    sim.state.set_reg(conv::NAME, Value::Name(name));
    match sim.run(code).expect("stub execution") {
        Outcome::Return(value) => value,
        other => panic!("stub did not return: {other:?}"),
    }
}

/// Run a store stub.
#[allow(dead_code)]
pub fn run_store_stub(
    ctx: &mut CompileContext,
    code: cinnabar::code::CodeHandle,
    receiver: ObjectRef,
    name: NameId,
    value: Value,
) -> Value {
    let mut sim = Simulator::new(ctx);
    sim.state.set_reg(conv::RECEIVER, Value::Object(receiver));
    sim.state.set_reg(conv::NAME, Value::Name(name));
    sim.state.set_reg(conv::VALUE, value);
    match sim.run(code).expect("stub execution") {
        Outcome::Return(value) => value,
        other => panic!("stub did not return: {other:?}"),
    }
}
