mod propagate;

pub use propagate::propagate;
