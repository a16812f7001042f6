use std::fmt::Debug;
use std::hash::Hash;

use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, EntityTrait, FromQueryResult, IntoActiveModel,
    TryGetable, Value,
};

use crate::config::ClosureTableConfig;

/// Capability set a SeaORM `Model` exposes to take part in a closure table.
///
/// The engine only needs the primary key, the parent key and a way to write the
/// parent key back. Implementations are normally provided by
/// `#[derive(ClosureNode)]`.
pub trait ClosureNode:
    Clone + Send + Sync + 'static + IntoActiveModel<Self::ActiveModel> + FromQueryResult
{
    type Entity: EntityTrait<Model = Self>;
    type ActiveModel: ActiveModelTrait<Entity = Self::Entity> + ActiveModelBehavior + Send;
    type Id: Clone + Debug + Eq + Hash + Send + Sync + 'static + TryGetable + Into<Value>;

    fn closure_config() -> &'static ClosureTableConfig;

    fn key(&self) -> Self::Id;
    fn parent_key(&self) -> Option<Self::Id>;
    fn set_parent_key(active: &mut Self::ActiveModel, parent: Option<Self::Id>);

    fn key_to_value(id: &Self::Id) -> Value {
        id.clone().into()
    }

    fn key_column() -> <Self::Entity as EntityTrait>::Column;
    fn parent_column() -> <Self::Entity as EntityTrait>::Column;
}
