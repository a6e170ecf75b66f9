//! Customer segmentation: rule trees, evaluation, store pushdown, audience
//! resolution, lookalike synthesis and segment management.

pub mod builder;
pub mod evaluator;
pub mod lookalike;
pub mod manager;
pub mod query;
pub mod resolver;
pub mod rules;
pub mod store;

pub use builder::RuleBuilder;
pub use evaluator::{matches, Evaluator};
pub use lookalike::{LookalikeContext, LookalikeSuggestion, LookalikeSynthesizer, RecipientHistory};
pub use manager::{InMemorySegmentRepository, NewSegment, Segment, SegmentManager, SegmentRepository};
pub use query::{plan, to_query, QueryCapabilities, QueryPlan, StoreQuery};
pub use resolver::{AudiencePreview, AudienceResolver};
pub use rules::{validate_rule, Condition, Field, LogicalOperator, OperatorKind, RuleGroup, RuleNode, TimeUnit};
pub use store::{CustomerStore, InMemoryCustomerStore};
