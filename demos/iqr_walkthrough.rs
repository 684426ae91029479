//! End-to-end walkthrough of `lsh_iqr`.
//!
//! Stores descriptors on disk, builds an LSH index over them, runs an IQR
//! session with a few rounds of feedback, and saves the hash map artifact so
//! a second index can be stood up without re-hashing.
//!
//! Run with:
//!   cargo run --example iqr_walkthrough

use std::sync::Arc;

use lsh_iqr::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const DIM: usize = 64;
const CLUSTERS: usize = 8;
const PER_CLUSTER: usize = 250;

fn main() -> Result<()> {
    let workdir = tempfile::tempdir()?;

    // ---------------------------------------------------------------
    // 1. File-backed descriptor store.
    // ---------------------------------------------------------------
    println!("=== Step 1: Store {} descriptors ===", CLUSTERS * PER_CLUSTER);
    let store = Arc::new(FileDescriptorStore::open(workdir.path().join("descriptors"))?);
    let factory = DescriptorElementFactory::new(store);

    let mut rng = StdRng::seed_from_u64(123);
    let normal = Normal::new(0.0_f32, 1.0).expect("valid distribution");
    let noise = Normal::new(0.0_f32, 0.15).expect("valid distribution");

    let centers: Vec<Vector> = (0..CLUSTERS)
        .map(|_| Vector::from_shape_fn(DIM, |_| normal.sample(&mut rng)))
        .collect();
    let mut elements = Vec::with_capacity(CLUSTERS * PER_CLUSTER);
    for (c, center) in centers.iter().enumerate() {
        for i in 0..PER_CLUSTER {
            let v = center.mapv(|x| x + noise.sample(&mut rng));
            elements.push(factory.create("demo", &format!("c{c}-{i:03}"), v)?);
        }
    }
    println!("Descriptors written under {}\n", workdir.path().display());

    // ---------------------------------------------------------------
    // 2. Build the index.
    // ---------------------------------------------------------------
    println!("=== Step 2: Build the index ===");
    let functor = Arc::new(HyperplaneFunctor::random(DIM, 16, &mut rng)?);
    let index = Arc::new(
        LshNearestNeighborsIndex::builder()
            .functor(functor.clone())
            .enable_metrics()
            .build()?,
    );
    index.build_index(elements)?;
    println!("{}\n", index.stats());

    // ---------------------------------------------------------------
    // 3. Plain nearest-neighbour query.
    // ---------------------------------------------------------------
    println!("=== Step 3: Query near cluster 0 ===");
    let query_vec = centers[0].mapv(|x| x + noise.sample(&mut rng));
    for nb in index.nn(query_vec.view(), 5)? {
        println!("  {:<10} distance={}", nb.uuid, nb.distance);
    }
    println!();

    // ---------------------------------------------------------------
    // 4. Interactive refinement.
    // ---------------------------------------------------------------
    println!("=== Step 4: IQR session ===");
    let results = Arc::new(MemoryClassificationStore::new());
    let manager = IqrSessionManager::new(ManagerConfig::default())?
        .with_classification_store(results.clone(), "iqr");
    let session = manager.create_session(Arc::clone(&index), Arc::new(KernelRanker::default()))?;

    // Start between clusters 0 and 1, then steer toward cluster 1.
    let blended = (&centers[0] + &centers[1]) * 0.5f32;
    let query = factory.create("query", "walkthrough", blended)?;
    let initial = session.initialize(&query, 10)?;
    println!("Initial top hits:");
    for r in &initial {
        println!("  {:<10} score={:.3}", r.uuid, r.score);
    }

    session.adjudicate(&["c1-000", "c1-001"], &["c0-000", "c0-001"], &[], &[])?;
    session.refine(&RefineBudget::unlimited())?;
    println!("\nAfter one round of feedback:");
    for r in session.top(10)? {
        println!("  {:<10} score={:.3}", r.uuid, r.score);
    }

    let top = session.top(1)?;
    let best = &top[0];
    let stored = ClassificationElement::new(results, "iqr", best.uuid.as_str());
    let (label, confidence) = stored.max_label()?;
    println!("Stored result for {}: {label} ({confidence:.3})\n", best.uuid);
    manager.close(session.id())?;

    // ---------------------------------------------------------------
    // 5. Save and reload the hash map.
    // ---------------------------------------------------------------
    println!("=== Step 5: Persist the hash map ===");
    let path = workdir.path().join("hash2uuids.bin");
    index.export_hash_map().save_bincode(&path)?;

    let reloaded = LshNearestNeighborsIndex::builder()
        .functor(functor)
        .build()?;
    reloaded.load_hash_map(HashToIds::load_bincode(&path)?, &factory, "demo")?;
    let again = reloaded.nn(query_vec.view(), 5)?;
    println!(
        "Reloaded index holds {} ids; top hit {}",
        reloaded.count(),
        again[0].uuid
    );

    if let Some(m) = index.metrics() {
        println!("\n{m}");
    }

    Ok(())
}
