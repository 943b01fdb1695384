/// A fixed-capacity slot ring, used for the 'g' protocol's retransmit buffer.
pub mod ring;
/// A generation-counted pool of recycled slots, used for the `stransfer` pool.
pub mod pool;
