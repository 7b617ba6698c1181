//! Task functions shared by the unit tests.

use serde_json::Value;

use crate::task_fn;

#[task_fn(name = "fixtures::echo")]
fn echo(value: Value) -> Value {
    value
}

#[task_fn(name = "fixtures::add")]
fn add(x: i64, y: i64) -> i64 {
    x + y
}

#[task_fn(name = "fixtures::scale", defaults(factor = 10))]
fn scale(total: Vec<i64>, factor: i64) -> i64 {
    total.iter().sum::<i64>() * factor
}

#[task_fn(name = "fixtures::boom")]
fn boom() -> anyhow::Result<i64> {
    anyhow::bail!("boom")
}

#[task_fn(name = "fixtures::explode")]
fn explode() {
    panic!("exploded")
}
