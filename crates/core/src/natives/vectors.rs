//! Numeric vector natives: constructors in the `vec` module, operations
//! on the vector method table.

use crate::error::{ErrorKind, NativeError};
use crate::natives::{
    define_fallible, define_infallible_method, define_method, number_arg,
};
use crate::object::{Object, Vector};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

const EPSILON: f64 = 1e-10;

pub(crate) fn module_table(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_fallible(vm, &mut table, "vec2", 2, vec2);
    define_fallible(vm, &mut table, "vec3", 3, vec3);
    table
}

pub(crate) fn vector_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_method(vm, &mut table, "add", 1, add);
    define_method(vm, &mut table, "sub", 1, sub);
    define_method(vm, &mut table, "scale", 1, scale);
    define_method(vm, &mut table, "dot", 1, dot);
    define_method(vm, &mut table, "cross", 1, cross);
    define_method(vm, &mut table, "magnitude", 0, magnitude);
    define_method(vm, &mut table, "normalize", 0, normalize);
    define_method(vm, &mut table, "distance", 1, distance);
    define_method(vm, &mut table, "lerp", 2, lerp);
    define_method(vm, &mut table, "reflect", 1, reflect);
    define_infallible_method(vm, &mut table, "x", 0, component_x);
    define_infallible_method(vm, &mut table, "y", 0, component_y);
    define_infallible_method(vm, &mut table, "z", 0, component_z);
    table
}

fn vector_arg(vm: &Vm, args: &[Value], index: usize, name: &str) -> Result<Vector, NativeError> {
    if let Value::Object(r) = args[index] {
        if let Object::Vector(v) = vm.heap.get(r) {
            return Ok(*v);
        }
    }
    Err(NativeError::new(
        ErrorKind::Type,
        format!("Argument <{}> must be of type 'vector'.", name),
    ))
}

fn same_dims(a: &Vector, b: &Vector) -> Result<(), NativeError> {
    if a.dims != b.dims {
        return Err(NativeError::new(
            ErrorKind::Value,
            "Vector dimensions must match.",
        ));
    }
    Ok(())
}

fn vec2(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "x")?;
    let y = number_arg(args, 1, "y")?;
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&[x, y])))))
}

fn vec3(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "x")?;
    let y = number_arg(args, 1, "y")?;
    let z = number_arg(args, 2, "z")?;
    Ok(Value::Object(
        vm.alloc(Object::Vector(Vector::new(&[x, y, z]))),
    ))
}

fn add(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let b = vector_arg(vm, args, 1, "other")?;
    same_dims(&a, &b)?;
    let parts: Vec<f64> = a
        .parts()
        .iter()
        .zip(b.parts())
        .map(|(x, y)| x + y)
        .collect();
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn sub(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let b = vector_arg(vm, args, 1, "other")?;
    same_dims(&a, &b)?;
    let parts: Vec<f64> = a
        .parts()
        .iter()
        .zip(b.parts())
        .map(|(x, y)| x - y)
        .collect();
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn scale(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let factor = number_arg(args, 1, "factor")?;
    let parts: Vec<f64> = a.parts().iter().map(|x| x * factor).collect();
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn dot(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let b = vector_arg(vm, args, 1, "other")?;
    same_dims(&a, &b)?;
    let product = a
        .parts()
        .iter()
        .zip(b.parts())
        .map(|(x, y)| x * y)
        .sum();
    Ok(Value::Float(product))
}

fn cross(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let b = vector_arg(vm, args, 1, "other")?;
    if a.dims != 3 || b.dims != 3 {
        return Err(NativeError::new(
            ErrorKind::Value,
            "Cross product requires three-dimensional vectors.",
        ));
    }
    let (p, q) = (a.parts(), b.parts());
    let parts = [
        p[1] * q[2] - p[2] * q[1],
        p[2] * q[0] - p[0] * q[2],
        p[0] * q[1] - p[1] * q[0],
    ];
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn magnitude_of(v: &Vector) -> f64 {
    v.parts().iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn magnitude(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    Ok(Value::Float(magnitude_of(&a)))
}

fn normalize(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let magnitude = magnitude_of(&a);
    if magnitude < EPSILON {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Cannot normalize a zero-length vector.",
        ));
    }
    let parts: Vec<f64> = a.parts().iter().map(|x| x / magnitude).collect();
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn distance(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let b = vector_arg(vm, args, 1, "other")?;
    same_dims(&a, &b)?;
    let sum: f64 = a
        .parts()
        .iter()
        .zip(b.parts())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Ok(Value::Float(sum.sqrt()))
}

fn lerp(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = vector_arg(vm, args, 0, "self")?;
    let b = vector_arg(vm, args, 1, "other")?;
    same_dims(&a, &b)?;
    let t = number_arg(args, 2, "t")?;
    let parts: Vec<f64> = a
        .parts()
        .iter()
        .zip(b.parts())
        .map(|(x, y)| x + t * (y - x))
        .collect();
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn reflect(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let incident = vector_arg(vm, args, 0, "self")?;
    let normal = vector_arg(vm, args, 1, "normal")?;
    same_dims(&incident, &normal)?;
    let normal_magnitude = magnitude_of(&normal);
    if normal_magnitude < EPSILON {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Cannot reflect across a zero-length normal.",
        ));
    }
    let unit: Vec<f64> = normal.parts().iter().map(|x| x / normal_magnitude).collect();
    let dot: f64 = incident
        .parts()
        .iter()
        .zip(&unit)
        .map(|(x, y)| x * y)
        .sum();
    let parts: Vec<f64> = incident
        .parts()
        .iter()
        .zip(&unit)
        .map(|(x, n)| x - 2.0 * dot * n)
        .collect();
    Ok(Value::Object(vm.alloc(Object::Vector(Vector::new(&parts)))))
}

fn component(vm: &Vm, args: &[Value], index: usize) -> Value {
    if let Value::Object(r) = args[0] {
        if let Object::Vector(v) = vm.heap.get(r) {
            if let Some(part) = v.parts().get(index) {
                return Value::Float(*part);
            }
        }
    }
    Value::Nil
}

fn component_x(vm: &mut Vm, args: &[Value]) -> Value {
    component(vm, args, 0)
}

fn component_y(vm: &mut Vm, args: &[Value]) -> Value {
    component(vm, args, 1)
}

fn component_z(vm: &mut Vm, args: &[Value]) -> Value {
    component(vm, args, 2)
}
