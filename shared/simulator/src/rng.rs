pub use rand_chacha::ChaCha8Rng as SeededRng;

/// Independent deterministic stream for one consumer of the race seed.
pub fn new_rng(seed: u32, stream: &str) -> SeededRng {
    rand_seeder::Seeder::from(format!("{seed}/{stream}")).make_rng()
}
