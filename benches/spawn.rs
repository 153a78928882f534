use criterion::{criterion_group, criterion_main, Criterion};

use ratchet::{register_device, resources, Device, DeviceSetRequirements, Scheduler, TaskStep};

fn spawn_throughput(c: &mut Criterion) {
    let devices: Vec<Device> = (0..4)
        .map(|i| register_device(format!("bench-cpu:{}", i), resources! { "cores" => 4.0 }))
        .collect();

    c.bench_function("spawn 64 empty tasks", |b| {
        b.iter(|| {
            let req = DeviceSetRequirements::new(resources! { "cores" => 1.0 }, 1, devices.clone());
            Scheduler::new(4)
                .scope(|ctx| {
                    for _ in 0..64 {
                        ctx.spawn(vec![], req.clone(), |_task| Ok(TaskStep::done()));
                    }
                })
                .unwrap();
        })
    });
}

criterion_group!(benches, spawn_throughput);
criterion_main!(benches);
