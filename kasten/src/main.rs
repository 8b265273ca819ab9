use std::{process, sync::Arc, thread, time::Instant};

use clap::{Parser as ClapParser, ValueEnum};
use log::info;

use kasten::{
    Bindings, CountingAllocator, Escape, MethodSignature, PointerLayout, Receiver, Runtime,
    RuntimeCreateInfo, SystemAllocator, TypeSwitch, ValueBox, ValueKind, Word, same_storage,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario to run
    #[arg(value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Threads racing for the first dispatch table build
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Log registrations and table builds
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    Measure,
    Switch,
    Contention,
    ZeroSize,
    Compound,
    All,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    x: i32,
    y: i32,
}

fn point_length(receiver: Receiver<'_>, _: &[Word]) -> Word {
    match receiver.downcast::<Point>() {
        Some(p) => Word::from(p.x.abs() + p.y.abs()),
        None => Word::ZERO,
    }
}

#[derive(Debug, Clone, Copy)]
struct Calculator {
    acc: i64,
}

fn calc_add(receiver: Receiver<'_>, args: &[Word]) -> Word {
    // pointer receiver: the box holds a `*const Calculator`
    match receiver.downcast::<*const Calculator>() {
        // SAFETY: the demo keeps the calculator alive while boxed
        Some(calc) => Word::from(unsafe { (*calc).acc } + args[0].as_i64()),
        None => Word::ZERO,
    }
}

fn calc_sub(receiver: Receiver<'_>, args: &[Word]) -> Word {
    match receiver.downcast::<*const Calculator>() {
        // SAFETY: see calc_add
        Some(calc) => Word::from(unsafe { (*calc).acc } - args[0].as_i64()),
        None => Word::ZERO,
    }
}

fn measure() -> kasten::Result<()> {
    let runtime = Runtime::default();
    let point = runtime.register_type::<Point>("Point", PointerLayout::none())?;
    let measurable = runtime.declare(
        "Measurable",
        vec![MethodSignature::new("length", &[], Some(ValueKind::I32))],
    )?;
    runtime.implement(point, measurable, Bindings::new().bind("length", point_length))?;

    let value = Point { x: 3, y: -4 };
    let boxed = runtime.box_capability(&value, point, measurable, Escape::Heap)?;
    let boxed_length = boxed.invoke(0, &[])?.as_i32();

    let direct = runtime.direct_method(point, "length")?;
    let direct_length = direct(Receiver::of(&value, point)?, &[]).as_i32();

    println!("measure: {value:?} boxed length {boxed_length}, direct length {direct_length}");
    Ok(())
}

fn switch() -> kasten::Result<()> {
    let runtime = Runtime::default();
    let u16_ty = runtime.register_type::<u16>("u16", PointerLayout::none())?;
    let u32_ty = runtime.register_type::<u32>("u32", PointerLayout::none())?;
    let f64_ty = runtime.register_type::<f64>("f64", PointerLayout::none())?;

    let mut switch = TypeSwitch::new()
        .case_value::<u16>(u16_ty, |v| format!("u16 {v}"))?
        .case_value::<u32>(u32_ty, |v| format!("u32 {v}"))?
        .otherwise(|receiver| format!("unhandled `{}`", receiver.concrete_type().name()));

    let values = [
        runtime.box_value(&7u16, u16_ty, Escape::Local)?,
        runtime.box_value(&70_000u32, u32_ty, Escape::Local)?,
        runtime.box_value(&0.5f64, f64_ty, Escape::Local)?,
    ];
    for value in &values {
        if let Some(outcome) = switch.evaluate(value) {
            println!("switch: {outcome}");
        }
    }
    Ok(())
}

fn contention(threads: usize) -> kasten::Result<()> {
    let runtime = Runtime::default();
    let point = runtime.register_type::<Point>("Point", PointerLayout::none())?;
    let measurable = runtime.declare(
        "Measurable",
        vec![MethodSignature::new("length", &[], Some(ValueKind::I32))],
    )?;
    runtime.implement(point, measurable, Bindings::new().bind("length", point_length))?;

    let start = Instant::now();
    let results: Vec<kasten::Result<i32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let runtime = &runtime;
                scope.spawn(move || -> kasten::Result<i32> {
                    let value = Point { x: i as i32, y: 1 };
                    let boxed = runtime.box_capability(&value, point, measurable, Escape::Heap)?;
                    Ok(boxed.invoke(0, &[])?.as_i32())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Ok(-1)))
            .collect()
    });
    let total: i32 = results.into_iter().sum::<kasten::Result<i32>>()?;

    println!(
        "contention: {threads} threads, {} table build(s), sum {total}, {:?}",
        runtime.tables.builds(),
        start.elapsed()
    );
    Ok(())
}

fn zero_size() -> kasten::Result<()> {
    #[derive(Clone, Copy)]
    struct Empty;

    let counter = Arc::new(CountingAllocator::new(SystemAllocator));
    let runtime = Runtime::new(RuntimeCreateInfo {
        allocator: Some(counter.clone()),
        ..Default::default()
    });
    let empty = runtime.register_type::<Empty>("Empty", PointerLayout::none())?;
    let unit = runtime.register_type::<()>("unit", PointerLayout::none())?;
    let byte = runtime.register("byte", 1, PointerLayout::none())?;
    let block = runtime.register("block", 256, PointerLayout::none())?;

    let a = runtime.box_value(&Empty, empty, Escape::Heap)?;
    let b = runtime.box_value(&(), unit, Escape::Heap)?;
    let c = runtime.box_bytes(&[42], byte, Escape::Heap)?;
    let d = runtime.box_bytes(&[0; 256], block, Escape::Heap)?;

    println!(
        "zero-size: shared {}, storage {:?} {:?} {:?}, {} allocation(s)",
        same_storage(&a, &b),
        a.storage().kind(),
        c.storage().kind(),
        d.storage().kind(),
        counter.allocations()
    );
    Ok(())
}

fn compound() -> kasten::Result<()> {
    let runtime = Runtime::default();
    let calc = runtime.register_type::<*const Calculator>("*Calculator", PointerLayout::pointer())?;
    let binary = [ValueKind::I64];
    let adder = runtime.declare(
        "Adder",
        vec![MethodSignature::new("add", &binary, Some(ValueKind::I64))],
    )?;
    let subber = runtime.declare(
        "Subber",
        vec![MethodSignature::new("sub", &binary, Some(ValueKind::I64))],
    )?;
    let mather = runtime.declare_compound("Mather", &[adder, subber])?;
    runtime.implement(calc, adder, Bindings::new().bind("add", calc_add))?;
    runtime.implement(calc, subber, Bindings::new().bind("sub", calc_sub))?;
    let before = runtime.capabilities.implements(calc, mather);
    runtime.implement(calc, mather, Bindings::new())?;
    info!(
        "`{}` word 0 is a pointer: {}, implements `Mather` before/after: {before}/{}",
        calc.name(),
        calc.pointer_layout().is_pointer(0),
        runtime.capabilities.implements(calc, mather)
    );

    let target = Calculator { acc: 6754 };
    let reference: *const Calculator = &target;
    let boxed = runtime.box_capability(&reference, calc, mather, Escape::Heap)?;
    let sum = boxed.invoke_named("add", &[Word::from(10i64)])?.as_i64();
    let difference = boxed.invoke_named("sub", &[Word::from(10i64)])?.as_i64();

    let narrowed = runtime.convert(boxed, adder).map_err(|(_, err)| err)?;
    let again = narrowed.invoke(0, &[Word::from(1i64)])?.as_i64();

    println!(
        "compound: add {sum}, sub {difference}, as `{}` add {again}",
        narrowed.capability().name()
    );
    Ok(())
}

fn run(scenario: Scenario, threads: usize) -> kasten::Result<()> {
    info!("running {scenario:?}");
    match scenario {
        Scenario::Measure => measure(),
        Scenario::Switch => switch(),
        Scenario::Contention => contention(threads),
        Scenario::ZeroSize => zero_size(),
        Scenario::Compound => compound(),
        Scenario::All => {
            measure()?;
            switch()?;
            contention(threads)?;
            zero_size()?;
            compound()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    if let Err(err) = run(cli.scenario, cli.threads.max(1)) {
        eprintln!("Error running {:?}: {}", cli.scenario, err);
        process::exit(1);
    }
}
