use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rbydfs::rbyd::tag;
use rbydfs::rbyd::{Rattr, Rbyd};
use rbydfs::storage::{Bd, RamBlockDevice};
use rbydfs::{Filesystem, FsConfig};

fn bench_config() -> FsConfig {
    let mut cfg = FsConfig::new(4096, 256);
    cfg.read_size = 1;
    cfg.prog_size = 1;
    cfg
}

fn bench_rbyd_append(c: &mut Criterion) {
    let cfg = bench_config();
    c.bench_function("rbyd_append_64", |b| {
        b.iter(|| {
            let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
            let mut bd = Bd::new(Box::new(ram), &cfg).unwrap();
            bd.erase(2).unwrap();
            let mut rbyd = Rbyd::create(&mut bd, 2, 1).unwrap();
            for i in 0..64u32 {
                let name = format!("n{:04}", i);
                rbyd.commit(&mut bd, &[(i as i32, Rattr::buf(tag::REG, 1, name.into_bytes()))])
                    .unwrap();
            }
            black_box(rbyd.weight)
        })
    });
}

fn bench_rbyd_lookup(c: &mut Criterion) {
    let cfg = bench_config();
    let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
    let mut bd = Bd::new(Box::new(ram), &cfg).unwrap();
    bd.erase(2).unwrap();
    let mut rbyd = Rbyd::create(&mut bd, 2, 1).unwrap();
    for i in 0..64u32 {
        rbyd.commit(&mut bd, &[(i as i32, Rattr::buf(tag::REG, 1, vec![i as u8; 8]))])
            .unwrap();
    }
    c.bench_function("rbyd_lookup_next", |b| {
        let mut rid = 0;
        b.iter(|| {
            rid = (rid + 17) % 64;
            black_box(rbyd.lookup_next(&mut bd, rid, 0).unwrap().rid)
        })
    });
}

fn bench_small_file_writes(c: &mut Criterion) {
    let cfg = bench_config();
    c.bench_function("fs_write_32_small_files", |b| {
        b.iter(|| {
            let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
            Filesystem::format(Box::new(ram.clone()), &cfg).unwrap();
            let mut fs = Filesystem::mount(Box::new(ram), &cfg).unwrap();
            for i in 0..32 {
                fs.write(&format!("/f{}", i), 0, b"benchmark payload").unwrap();
            }
            black_box(fs.usage().unwrap().blocks_used)
        })
    });
}

criterion_group!(benches, bench_rbyd_append, bench_rbyd_lookup, bench_small_file_writes);
criterion_main!(benches);
