use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use heap::cycle::{
    EvacOutcome, evacuate_collection_set, finish_cycle, prepare_evacuation,
    update_references,
};
use heap::{
    AllocCounters, CancelCause, ControlCounters, GcState, GcThread, Heap,
    HeapInner, HeapSettings, resolve_forwarded,
};
use log::{info, warn};
use object::{ObjRef, RefSlot, ref_slots};

mod graph;

use graph::{GraphShape, Rng};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Heap size in MB
    #[arg(long, default_value_t = 64)]
    heap_mb: usize,

    /// Region size in KB
    #[arg(long, default_value_t = 256)]
    region_kb: usize,

    /// Objects in the synthetic graph
    #[arg(long, default_value_t = 100_000)]
    objects: usize,

    /// Maximum reference fields per object
    #[arg(long, default_value_t = 4)]
    max_refs: usize,

    #[arg(long, default_value_t = 4, help = "GC worker threads")]
    workers: usize,

    #[arg(long, default_value_t = 2, help = "Mutator threads racing the workers")]
    mutators: usize,

    #[arg(long, default_value_t = 3)]
    cycles: usize,

    /// Collect the whole heap as one generation
    #[arg(long)]
    single_generation: bool,

    #[arg(long, default_value_t = 2, help = "Age at which young objects are promoted")]
    tenuring_threshold: u32,

    /// Copy old objects through the shared allocator only
    #[arg(long)]
    no_plab: bool,

    /// Cancel each cycle after this many milliseconds of evacuation
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings = HeapSettings {
        heap_size: cli.heap_mb * 1024 * 1024,
        region_size: cli.region_kb * 1024,
        generational: !cli.single_generation,
        tenuring_threshold: cli.tenuring_threshold,
        use_plab: !cli.no_plab,
        ..Default::default()
    };
    let control = Arc::new(ControlCounters::default());
    let heap = match Heap::with_controller(settings, control.clone()) {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("Error creating heap: {err}");
            process::exit(1);
        }
    };

    let mut rng = Rng::new(cli.seed);
    let shape = GraphShape {
        objects: cli.objects,
        max_refs: cli.max_refs,
        old_every: if cli.single_generation { 0 } else { 10 },
        root_every: 16,
    };
    let mut roots = match graph::build(&heap, shape, &mut rng) {
        Ok(roots) => roots,
        Err(err) => {
            eprintln!("Error building object graph: {err}");
            process::exit(1);
        }
    };
    info!("built {} objects, {} roots", cli.objects, roots.len());

    for cycle in 1..=cli.cycles {
        if let Err(err) = run_cycle(&heap, &cli, cycle, &mut roots, &mut rng) {
            eprintln!("Error in cycle {cycle}: {err}");
            process::exit(1);
        }
        match graph::verify(&heap, &roots, false) {
            Ok(reached) => info!("cycle {cycle}: verified {reached} reachable objects"),
            Err(err) => {
                eprintln!("Verification failed after cycle {cycle}: {err}");
                process::exit(1);
            }
        }
    }

    print_summary(&heap, &control);
    if heap.clear_old_evacuation_failure() {
        warn!("old evacuation failed, a full collection is due");
    }
}

fn run_cycle(
    heap: &Heap,
    cli: &Cli,
    cycle: usize,
    roots: &mut Vec<RefSlot>,
    rng: &mut Rng,
) -> Result<(), String> {
    let marked = graph::mark(heap, roots);
    let kind = if heap.is_generational() {
        GcState::YOUNG_CYCLE | GcState::AGING_CYCLE
    } else {
        GcState::empty()
    };
    let regions = prepare_evacuation(heap, kind, |r| r.used_words() > 0);
    info!("cycle {cycle}: {marked} live objects, {regions} regions to evacuate");

    let stop = AtomicBool::new(false);
    let roots_ref: &[RefSlot] = roots;
    let outcome = thread::scope(|s| {
        for m in 0..cli.mutators {
            let seed = rng.next_u64() ^ m as u64;
            let stop = &stop;
            s.spawn(move || mutator(heap, roots_ref, seed, stop));
        }
        if let Some(ms) = cli.cancel_after_ms {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(ms));
                heap.cancel_gc(CancelCause::DegenerateRequested);
            });
        }
        let outcome = evacuate_collection_set(heap, cli.workers);
        stop.store(true, Ordering::Release);
        outcome
    })
    .map_err(|e| e.to_string())?;

    let outcome = if outcome.cancelled || heap.cancelled_gc() {
        degenerate(heap, cli.workers)?
    } else {
        outcome
    };
    report_evacuation(cycle, &outcome);

    if !update_references(heap, cli.workers, roots)
        .map_err(|e| e.to_string())?
    {
        return Err("reference update cancelled".into());
    }
    graph::verify(heap, roots, true)?;
    if finish_cycle(heap) {
        info!("cycle {cycle} was cancelled and finished degenerated");
    }
    Ok(())
}

/// Finishes an interrupted evacuation with the mutators stopped.
fn degenerate(heap: &HeapInner, workers: usize) -> Result<EvacOutcome, String> {
    warn!("evacuation cancelled ({:?}), finishing degenerated", heap.cancel.cause());
    heap.clear_cancelled_gc(true);
    let outcome = evacuate_collection_set(heap, workers).map_err(|e| e.to_string())?;
    if outcome.cancelled {
        return Err("out of memory in degenerated evacuation".into());
    }
    Ok(outcome)
}

/// Load barrier: evacuates a collection set referent and heals the slot.
fn load_barrier(heap: &HeapInner, slot: &RefSlot, thread: &mut GcThread) -> Option<ObjRef> {
    let obj = slot.load()?;
    if !heap.has_forwarded_objects() || !heap.in_collection_set(obj) {
        return Some(obj);
    }
    let copy = if heap.is_evacuation_in_progress() {
        heap.enter_evacuation(thread);
        let copy = heap.evacuate_object(obj, thread);
        heap.leave_evacuation(thread);
        copy
    } else {
        resolve_forwarded(obj)
    };
    if copy != obj {
        HeapInner::cas_ref(Some(copy), slot, Some(obj));
    }
    Some(copy)
}

fn mutator(heap: &Heap, roots: &[RefSlot], seed: u64, stop: &AtomicBool) {
    let mut thread = heap.thread();
    let mut rng = Rng::new(seed);
    let (mut loads, mut stores) = (0usize, 0usize);

    while !stop.load(Ordering::Acquire) && !roots.is_empty() {
        let Some(obj) = load_barrier(heap, &roots[rng.below(roots.len())], &mut thread) else {
            continue;
        };
        let fields = ref_slots(obj);
        if fields.is_empty() {
            continue;
        }
        let field = &fields[rng.below(fields.len())];
        if rng.below(4) == 0 {
            let other = &roots[rng.below(roots.len())];
            if let Some(value) = load_barrier(heap, other, &mut thread) {
                field.store(Some(value));
                if heap.region_containing(obj.addr()).is_old() {
                    heap.mark_card_as_dirty(field.addr());
                }
                stores += 1;
            }
        } else {
            load_barrier(heap, field, &mut thread);
            loads += 1;
        }
    }

    heap.retire_labs(&mut thread);
    info!(
        "mutator: {loads} loads, {stores} stores, {} barrier copies",
        thread.stats().copies_won
    );
}

fn report_evacuation(cycle: usize, outcome: &EvacOutcome) {
    let stats = &outcome.stats;
    println!(
        "cycle {cycle}: {} copies won, {} lost, {} shared, {} promoted, {} promotion failures, {} lab refills in {:.3}ms",
        stats.copies_won,
        stats.copies_lost,
        stats.shared_copies,
        stats.promotions,
        stats.promotion_failures,
        stats.lab_refills,
        outcome.elapsed.as_secs_f64() * 1000.0
    );
}

fn print_summary(heap: &Heap, control: &ControlCounters) {
    let counters = heap.free_set.counters();
    println!("== allocations ==");
    println!("  shared            {}", AllocCounters::get(&counters.shared));
    println!("  shared gc         {}", AllocCounters::get(&counters.shared_gc));
    println!("  shared promotion  {}", AllocCounters::get(&counters.shared_gc_promotion));
    println!("  gclab             {}", AllocCounters::get(&counters.gclab));
    println!("  plab              {}", AllocCounters::get(&counters.plab));
    println!("  humongous         {}", AllocCounters::get(&counters.humongous));
    println!("  failed            {}", AllocCounters::get(&counters.failed));
    println!("== evacuation failures ==");
    println!("  allocation        {} ({} words)", control.alloc_failures(), control.alloc_failure_words());
    println!("  old evacuation    {}", control.old_evacuation_failures());
    println!("  promotion         {}", control.promotion_failures());
    println!("  old allocated     {} KB", heap.old_allocated() / 1024);
    println!("== old generation ==");
    println!("  usage at last cycle start  {} KB", heap.reserves.captured_old_usage() / 1024);
    println!("  promoted in prior cycle    {} KB", heap.reserves.previous_promotion() / 1024);
    println!("  lent to mutators           {} KB", heap.reserves.alloc_supplement_reserve() / 1024);
    let latencies = heap.cancel.latencies();
    if latencies.num() > 0 {
        println!("== cancellation latency ==");
        println!("{latencies}");
    }
}
