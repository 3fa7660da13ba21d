// Shard codec benchmarks.
//
// Covers raw-key envelope sealing and opening, passphrase envelopes at the
// fast and default scrypt cost, recovery code round trips, and the 2-of-3
// split/combine over GF(256).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use trishard_wallet::config::KdfParams;
use trishard_wallet::shard::{
    combine_shards, decode_recovery_code, decrypt_shard, encode_recovery_code, encrypt_shard,
    split_seed, ShardKey, ShardRole, ShardSecret,
};

fn device_shard() -> ShardSecret {
    ShardSecret::new(ShardRole::Device, vec![0xA5; 32])
}

fn bench_raw_key_envelope(c: &mut Criterion) {
    let key = [0x11u8; 32];
    let secret = device_shard();
    let params = KdfParams::insecure_fast();

    c.bench_function("codec/encrypt_raw", |b| {
        b.iter(|| encrypt_shard(&secret, ShardKey::Raw(&key), &params).unwrap());
    });

    let envelope = encrypt_shard(&secret, ShardKey::Raw(&key), &params).unwrap();
    c.bench_function("codec/decrypt_raw", |b| {
        b.iter(|| decrypt_shard(&envelope, ShardKey::Raw(&key)).unwrap());
    });
}

fn bench_passphrase_envelope(c: &mut Criterion) {
    let secret = device_shard();
    let mut group = c.benchmark_group("codec/encrypt_passphrase");
    group.sample_size(10);
    for (name, params) in [
        ("fast", KdfParams::insecure_fast()),
        ("default", KdfParams::default()),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &params, |b, params| {
            b.iter(|| encrypt_shard(&secret, ShardKey::Passphrase(b"correct horse"), params).unwrap());
        });
    }
    group.finish();
}

fn bench_recovery_code(c: &mut Criterion) {
    let secret = ShardSecret::new(ShardRole::BackupOwner, vec![0x3C; 32]);
    let code = encode_recovery_code(&secret).unwrap();

    c.bench_function("codec/encode_recovery_code", |b| {
        b.iter(|| encode_recovery_code(&secret).unwrap());
    });
    c.bench_function("codec/decode_recovery_code", |b| {
        b.iter(|| decode_recovery_code(&code).unwrap());
    });
}

fn bench_sharing(c: &mut Criterion) {
    let seed = [0x42u8; 32];
    c.bench_function("sharing/split_seed", |b| {
        b.iter(|| split_seed(&seed).unwrap());
    });

    let shards = split_seed(&seed).unwrap();
    c.bench_function("sharing/combine_two", |b| {
        b.iter(|| combine_shards(&[&shards[0], &shards[2]]).unwrap());
    });
}

criterion_group!(
    benches,
    bench_raw_key_envelope,
    bench_passphrase_envelope,
    bench_recovery_code,
    bench_sharing
);
criterion_main!(benches);
