mod load;
mod random;
mod round_robin;
mod simple;

pub use load::LoadBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;
pub use simple::SimpleBalancer;
