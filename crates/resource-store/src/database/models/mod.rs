mod identity;
mod resource_entity;

pub use identity::Identity;
pub use resource_entity::ResourceEntity;
