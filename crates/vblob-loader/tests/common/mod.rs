#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vblob_loader::{BlobLoader, Image, LoaderConfig, PagingCoordinator};

/// Bytes that compress reasonably but are not trivially repetitive.
pub fn text_like(len: usize) -> Vec<u8> {
    const WORDS: [&[u8]; 6] = [b"block ", b"merkle ", b"frame ", b"page ", b"root ", b"seek "];
    let mut rng = StdRng::seed_from_u64(len as u64);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        out.extend_from_slice(WORDS[rng.gen_range(0..WORDS.len())]);
        if rng.gen_ratio(1, 9) {
            out.push(rng.gen());
        }
    }
    out.truncate(len);
    out
}

/// Incompressible bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut out = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(&mut out[..]);
    out
}

pub fn loader(image: &Image) -> Arc<BlobLoader> {
    Arc::new(BlobLoader::new(image.device.clone(), image.directory.clone()))
}

pub fn pager(image: &Image, config: LoaderConfig) -> Arc<PagingCoordinator> {
    Arc::new(PagingCoordinator::init(image.device.clone(), config).unwrap())
}
