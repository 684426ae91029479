use lsh_iqr::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn random_vector(rng: &mut StdRng, dim: usize) -> Vector {
    let normal = Normal::new(0.0f32, 1.0).unwrap();
    Vector::from_shape_fn(dim, |_| normal.sample(rng))
}

fn make_index(dim: usize, bits: usize, seed: u64) -> LshNearestNeighborsIndex {
    let functor = HyperplaneFunctor::random(dim, bits, &mut StdRng::seed_from_u64(seed)).unwrap();
    LshNearestNeighborsIndex::builder()
        .functor(Arc::new(functor))
        .build()
        .unwrap()
}

fn batch(
    factory: &DescriptorElementFactory,
    rng: &mut StdRng,
    ids: impl Iterator<Item = usize>,
    dim: usize,
) -> Vec<DescriptorElement> {
    ids.map(|i| {
        factory
            .create("desc", &format!("id{i:06}"), random_vector(rng, dim))
            .unwrap()
    })
    .collect()
}

// ---------------------------------------------------------------------------
// 1. Concurrent update + query
//    4 writers grow the index in batches while 4 readers query it.
//    Every query sees a consistent snapshot: results sorted, no duplicates.
// ---------------------------------------------------------------------------

#[test]
fn stress_concurrent_update_and_query() {
    let dim = 32;
    let per_writer = 2_000;
    let batch_size = 250;
    let num_writers = 4;
    let num_readers = 4;

    let factory = DescriptorElementFactory::in_memory();
    let index = Arc::new(make_index(dim, 12, 42));
    index.build_index(Vec::new()).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let mut writers = Vec::new();
    for t in 0..num_writers {
        let idx = Arc::clone(&index);
        let factory = factory.clone();
        writers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(t as u64);
            let start = t * per_writer;
            for chunk in (start..start + per_writer).step_by(batch_size) {
                let elements = batch(&factory, &mut rng, chunk..chunk + batch_size, dim);
                idx.update_index(elements).unwrap();
            }
        }));
    }

    let mut readers = Vec::new();
    for t in 0..num_readers {
        let idx = Arc::clone(&index);
        let done = Arc::clone(&done);
        readers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(100 + t as u64);
            let mut queries = 0usize;
            while !done.load(Ordering::Relaxed) {
                let q = random_vector(&mut rng, dim);
                let results = idx.nn(q.view(), 10).unwrap();
                assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
                let unique: HashSet<&str> = results.iter().map(|r| r.uuid.as_str()).collect();
                assert_eq!(unique.len(), results.len());
                queries += 1;
            }
            queries
        }));
    }

    for w in writers {
        w.join().expect("writer panicked");
    }
    done.store(true, Ordering::Relaxed);
    let total_queries: usize = readers
        .into_iter()
        .map(|r| r.join().expect("reader panicked"))
        .sum();

    assert_eq!(index.count(), num_writers * per_writer);
    assert!(total_queries > 0);
}

// ---------------------------------------------------------------------------
// 2. Large build
//    Index 20,000 vectors of dim=64 in one batch; stats and queries agree.
// ---------------------------------------------------------------------------

#[test]
fn stress_large_build() {
    let dim = 64;
    let n = 20_000;
    let factory = DescriptorElementFactory::in_memory();
    let mut rng = StdRng::seed_from_u64(7);
    let elements = batch(&factory, &mut rng, 0..n, dim);

    let index = make_index(dim, 16, 7);
    index.build_index(elements.clone()).unwrap();

    let stats = index.stats();
    assert_eq!(stats.num_ids, n);
    assert!(stats.num_codes > 1);
    assert!(stats.max_bucket_size >= 1);

    for e in elements.iter().step_by(1_000) {
        let results = index.nn_element(e, 5).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].uuid, e.uuid());
    }
}

// ---------------------------------------------------------------------------
// 3. Concurrent re-indexing of shared ids
//    Threads keep moving the same ids to new vectors. Afterwards every id is
//    filed under exactly the code of the vector it is bound to.
// ---------------------------------------------------------------------------

#[test]
fn stress_concurrent_reindex_shared_ids() {
    let dim = 16;
    let shared = 200;
    let index = Arc::new(make_index(dim, 10, 3));

    let mut handles = Vec::new();
    for t in 0..6u64 {
        let idx = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            // Each thread owns its store so its handles never change under it.
            let factory = DescriptorElementFactory::in_memory();
            let mut rng = StdRng::seed_from_u64(t);
            for _ in 0..10 {
                let lo = rng.gen_range(0..shared / 2);
                let elements = batch(&factory, &mut rng, lo..lo + shared / 2, dim);
                idx.update_index(elements).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().expect("thread panicked");
    }

    let ids = index.uuids();
    assert_eq!(ids.len(), index.count());
    assert_eq!(index.stats().num_ids, ids.len());
    for id in &ids {
        let element = index.descriptor(id).unwrap();
        let expected = index.functor().hash(element.vector().unwrap().view()).unwrap();
        assert_eq!(index.hash_code(id).unwrap(), expected, "id {id} filed under a stale code");
    }
}

// ---------------------------------------------------------------------------
// 4. Remove under concurrent reads
//    Removers delete disjoint slices while readers query. Removed ids never
//    resurface.
// ---------------------------------------------------------------------------

#[test]
fn stress_remove_under_concurrent_reads() {
    let dim = 24;
    let n = 2_000;
    let factory = DescriptorElementFactory::in_memory();
    let mut rng = StdRng::seed_from_u64(11);
    let index = Arc::new(make_index(dim, 12, 11));
    index.build_index(batch(&factory, &mut rng, 0..n, dim)).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for t in 0..4u64 {
        let idx = Arc::clone(&index);
        let done = Arc::clone(&done);
        readers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(200 + t);
            while !done.load(Ordering::Relaxed) {
                let q = random_vector(&mut rng, dim);
                idx.nn(q.view(), 20).unwrap();
            }
        }));
    }

    let mut removers = Vec::new();
    for t in 0..4usize {
        let idx = Arc::clone(&index);
        removers.push(thread::spawn(move || {
            for i in (t * 250..(t + 1) * 250).step_by(25) {
                let ids: Vec<String> = (i..i + 25).map(|j| format!("id{j:06}")).collect();
                idx.remove_from_index(&ids).unwrap();
            }
        }));
    }
    for r in removers {
        r.join().expect("remover panicked");
    }
    done.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().expect("reader panicked");
    }

    assert_eq!(index.count(), n - 1_000);
    let q = random_vector(&mut rng, dim);
    let everything = index.nn(q.view(), n).unwrap();
    assert_eq!(everything.len(), n - 1_000);
    for nb in &everything {
        let k: usize = nb.uuid[2..].parse().unwrap();
        assert!(k >= 1_000, "removed id {} returned", nb.uuid);
    }
}

// ---------------------------------------------------------------------------
// 5. Many sessions, concurrent feedback, reaper running
//    Sessions are driven from several threads while another thread keeps
//    advancing time and reaping. Every call either succeeds or reports the
//    session unavailable; nothing else.
// ---------------------------------------------------------------------------

#[test]
fn stress_sessions_with_reaper() {
    let dim = 16;
    let factory = DescriptorElementFactory::in_memory();
    let mut rng = StdRng::seed_from_u64(21);
    let index = Arc::new(make_index(dim, 10, 21));
    index.build_index(batch(&factory, &mut rng, 0..500, dim)).unwrap();

    let clock = Arc::new(ManualClock::new());
    let config = ManagerConfig {
        expiration_enabled: true,
        session: SessionConfig {
            ttl_seconds: 5,
            pool_size: 50,
        },
        ..ManagerConfig::default()
    };
    let manager = Arc::new(IqrSessionManager::with_clock(config, clock.clone()).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let reaper = {
        let manager = Arc::clone(&manager);
        let clock = Arc::clone(&clock);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reaped = 0usize;
            while !done.load(Ordering::Relaxed) {
                clock.advance(Duration::from_secs(1));
                reaped += manager.reap_expired().len();
                thread::yield_now();
            }
            reaped
        })
    };

    let mut workers = Vec::new();
    for t in 0..6u64 {
        let manager = Arc::clone(&manager);
        let index = Arc::clone(&index);
        let factory = factory.clone();
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(300 + t);
            for round in 0..10 {
                let session = manager
                    .create_session(Arc::clone(&index), Arc::new(KernelRanker::default()))
                    .unwrap();
                let query = factory
                    .create("query", &format!("q{t}-{round}"), random_vector(&mut rng, dim))
                    .unwrap();
                let mut steps = || -> Result<()> {
                    session.initialize(&query, 10)?;
                    let pos = format!("id{:06}", rng.gen_range(0..250));
                    let neg = format!("id{:06}", rng.gen_range(250..500));
                    session.adjudicate(&[pos.as_str()], &[neg.as_str()], &[], &[])?;
                    session.refine(&RefineBudget::unlimited())?;
                    manager.get(session.id())?;
                    Ok(())
                };
                match steps() {
                    Ok(()) | Err(Error::SessionUnavailable { .. }) => {}
                    Err(e) => panic!("unexpected error: {e:?}"),
                }
            }
        }));
    }
    for w in workers {
        w.join().expect("worker panicked");
    }
    done.store(true, Ordering::Relaxed);
    reaper.join().expect("reaper panicked");

    clock.advance(Duration::from_secs(10));
    manager.reap_expired();
    assert!(manager.is_empty());
}

// ---------------------------------------------------------------------------
// 6. Background reaper thread on the system clock
// ---------------------------------------------------------------------------

#[test]
fn stress_background_reaper_expires_sessions() {
    let config = ManagerConfig {
        expiration_enabled: true,
        reap_interval_seconds: 1,
        session: SessionConfig {
            ttl_seconds: 0,
            ..SessionConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = Arc::new(IqrSessionManager::new(config).unwrap());
    let handle = manager.spawn_reaper().unwrap();

    let index = Arc::new(make_index(4, 4, 1));
    let session = manager
        .create_session(index, Arc::new(KernelRanker::default()))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while session.state() != SessionState::Expired {
        assert!(Instant::now() < deadline, "reaper never expired the session");
        thread::sleep(Duration::from_millis(50));
    }
    assert!(matches!(
        manager.get(session.id()),
        Err(Error::SessionUnavailable { .. })
    ));

    handle.stop();
}

// ---------------------------------------------------------------------------
// 7. Concurrent writers to one file-store key
// ---------------------------------------------------------------------------

#[cfg(feature = "persistence")]
#[test]
fn stress_file_store_same_key_writers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileDescriptorStore::open(dir.path()).unwrap());
    let n_threads = 4;
    let writes = 300;

    let handles: Vec<_> = (0..n_threads)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let v = Arc::new(Vector::from_elem(32, t as f32));
                for _ in 0..writes {
                    store.set("t", "k", Arc::clone(&v)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // The final value is one writer's vector, never a mix.
    let v = store.get("t", "k").unwrap();
    assert_eq!(v.len(), 32);
    let first = v[0];
    assert!((0..n_threads).any(|t| t as f32 == first));
    assert!(v.iter().all(|&x| x == first));

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("t"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "temp files left behind: {leftovers:?}");
}
