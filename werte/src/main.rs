use clap::Parser as ClapParser;
use std::{process, thread, time::Duration};

use werte::{
    CallTarget, DrainWorker, ObjectId, ObjectKind, Runtime, RuntimeError,
    RuntimeSettings, ScriptRefBody, SharedRuntime, Value,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Instances to allocate in the churn pass
    #[arg(long, default_value_t = 64, help = "Instances to allocate")]
    objects: usize,

    /// Property overwrite rounds per instance
    #[arg(long, default_value_t = 4, help = "Overwrite rounds per instance")]
    churn: usize,

    /// Hand the staged sweep work to a background worker
    #[arg(long, help = "Drain deferred sweep work on a worker thread")]
    deferred: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        eprintln!("werte: {}", err);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), RuntimeError> {
    let mut rt = Runtime::with_settings(RuntimeSettings::default());

    // A pinned registry object owns everything the workload builds: a
    // roster array of instances and a script reference used for calls.
    let registry = rt.alloc_object(ObjectKind::Base)?;
    rt.pin(registry);

    let roster = rt.alloc_array(Vec::new())?;
    rt.set(registry, "roster", &roster)?;

    for i in 0..cli.objects {
        let unit = churn_instance(&mut rt, i, cli.churn)?;
        rt.array_push(&roster, Value::object(unit))?;
    }
    rt.release(roster);

    let heal = rt.alloc_script_ref(ScriptRefBody::new(CallTarget::Native(sum_args)))?;
    rt.set(registry, "heal", &Value::reference(heal))?;

    let healed = rt.call(heal, None, &[Value::real(2.5), Value::real(40.0)])?;
    println!("heal(2.5, 40.0) = {}", healed.to_f64()?);
    rt.release(healed);

    demo_weak_ref(&mut rt)?;

    let stats = rt.collect();
    println!(
        "churn pass: {} live, {} marked, {} freed, {} drained",
        stats.live, stats.marked, stats.freed, stats.drained
    );

    rt.unpin(registry);
    let stats = rt.collect();
    println!(
        "teardown: {} live, {} marked, {} freed, {} drained",
        stats.live, stats.marked, stats.freed, stats.drained
    );

    if cli.deferred {
        demo_deferred(rt, cli.objects)?;
    }
    Ok(())
}

/// Build one instance with a named string, a hit-point counter that gets
/// overwritten `churn` times, and a deleted scratch property.
fn churn_instance(
    rt: &mut Runtime,
    index: usize,
    churn: usize,
) -> Result<ObjectId, RuntimeError> {
    let unit = rt.alloc_object(ObjectKind::Instance)?;
    rt.set_class_name(unit, "churn_unit");

    let name = rt.alloc_string(&format!("unit-{index}"));
    rt.set(unit, "name", &name)?;
    rt.release(name);

    for round in 0..=churn {
        rt.set(unit, "hp", &Value::int32((100 + round) as i32))?;
    }

    rt.set(unit, "scratch", &Value::real(index as f64))?;
    rt.delete(unit, "scratch")?;
    Ok(unit)
}

/// Watch a weak reference go stale when its target is torn down.
fn demo_weak_ref(rt: &mut Runtime) -> Result<(), RuntimeError> {
    let target = rt.alloc_object(ObjectKind::Instance)?;
    let weak = rt.alloc_weak_ref(target)?;
    rt.pin(weak);

    rt.free_object_now(target);
    match rt.weak_target(weak) {
        Err(RuntimeError::StaleReference) => {
            println!("weak reference went stale with its target")
        }
        Ok(_) => println!("weak reference unexpectedly still live"),
        Err(err) => return Err(err),
    }
    rt.unpin(weak);
    Ok(())
}

/// Stage string decrements from several threads' worth of churn and let
/// the drain worker retire them.
fn demo_deferred(rt: Runtime, count: usize) -> Result<(), RuntimeError> {
    let shared = SharedRuntime::new(rt);
    let worker = DrainWorker::spawn(shared.clone());

    shared.with(|rt| -> Result<(), RuntimeError> {
        for i in 0..count {
            let text = rt.alloc_string(&format!("scratch-{i}"));
            rt.release(text);
        }
        Ok(())
    })?;

    let stats = shared.collect_deferred();
    println!(
        "deferred sweep: {} freed, {} pending after mark",
        stats.freed,
        shared.pending()
    );

    while shared.pending() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    worker.stop();
    println!("drain worker retired all staged work");
    Ok(())
}

/// Native call target: sum the arguments as reals.
fn sum_args(
    _rt: &mut Runtime,
    _scope: Option<ObjectId>,
    _this: Option<ObjectId>,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let mut total = 0.0;
    for arg in args {
        total += arg.to_f64()?;
    }
    Ok(Value::real(total))
}
