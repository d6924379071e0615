// Intentionally empty. This crate exists for its build script, which
// regenerates meshmetrics/src/proto from the definitions under proto/.
