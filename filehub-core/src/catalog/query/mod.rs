//! Query compiler for the small infix expression language described in
//! `SPEC_FULL.md` §4.5.3. `compile` turns a query string into a
//! [`CompiledQuery`]: a SQL `WHERE` fragment plus an ordered list of bind
//! slots, one of which may be [`Bind::VolumeSentinel`] — a placeholder
//! resolved to `vtop + "/"` once per volume at execution time (§9 design
//! note on the `"\nrd"` sentinel).

pub mod compile;

/// One bound parameter slot, in the order its `?` appears in
/// [`CompiledQuery::sql`].
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Str(String),
    Int(i64),
    /// Resolved per-volume to `vtop + "/"` at execution time; never sent to
    /// the database directly.
    VolumeSentinel,
}

/// The result of compiling a query string: a `WHERE`-clause fragment (empty
/// iff the query was empty, meaning "enumerate everything") and its bind
/// slots, plus whether the fragment references `up.*` / `mt.*` columns (used
/// by the executor to pick the right `SELECT`, §4.5.4).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledQuery {
    pub sql: String,
    pub binds: Vec<Bind>,
    pub have_up: bool,
    pub have_mt: bool,
}
