//! Minimal archetype-based entity registry: exactly the interface the draw
//! registry consumes from the outside world (component type descriptors,
//! tags, deferred structural changes, raw column access for staging).

use std::any::TypeId;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(pub u32);

/// Components are plain copyable data; instance-data components are staged
/// byte-for-byte into GPU buffers.
pub trait Component: Copy + 'static {}
impl<T: Copy + 'static> Component for T {}

/// Tags are zero-sized markers.
pub trait Tag: 'static {}

#[derive(Clone, Copy, Debug)]
pub struct ComponentTypeDesc {
    pub size: usize,
    pub name: &'static str,
}

struct Column {
    type_id: TypeId,
    elem_size: usize,
    data: Vec<u8>,
}

impl Column {
    fn push_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.elem_size);
        self.data.extend_from_slice(bytes);
    }

    fn remove_swap(&mut self, row: usize) {
        let last = self.data.len() - self.elem_size;
        let begin = row * self.elem_size;

        if begin != last {
            let (head, tail) = self.data.split_at_mut(last);
            head[begin..begin + self.elem_size].copy_from_slice(tail);
        }

        self.data.truncate(last);
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeSets {
    components: Vec<TypeId>,
    tags: Vec<TypeId>,
}

impl TypeSets {
    fn add_component(&mut self, id: TypeId) {
        if let Err(pos) = self.components.binary_search(&id) {
            self.components.insert(pos, id);
        }
    }

    fn add_tag(&mut self, id: TypeId) {
        if let Err(pos) = self.tags.binary_search(&id) {
            self.tags.insert(pos, id);
        }
    }

    pub fn contains_component(&self, id: TypeId) -> bool {
        self.components.binary_search(&id).is_ok()
    }

    pub fn contains_tag(&self, id: TypeId) -> bool {
        self.tags.binary_search(&id).is_ok()
    }
}

pub struct Archetype {
    sets: TypeSets,
    entities: Vec<Entity>,
    columns: Vec<Column>,
}

impl Archetype {
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn component_types(&self) -> &[TypeId] {
        &self.sets.components
    }

    pub fn contains<T: Component>(&self) -> bool {
        self.sets.contains_component(TypeId::of::<T>())
    }

    pub fn contains_tag<T: Tag>(&self) -> bool {
        self.sets.contains_tag(TypeId::of::<T>())
    }

    fn column(&self, id: TypeId) -> Option<&Column> {
        self.columns.iter().find(|c| c.type_id == id)
    }

    fn column_mut(&mut self, id: TypeId) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.type_id == id)
    }

    /// Raw bytes of a component column, `entity_count * size_of::<T>()`.
    pub fn column_bytes(&self, id: TypeId) -> Option<&[u8]> {
        self.column(id).map(|c| c.data.as_slice())
    }

    pub fn get<T: Component>(&self, row: usize) -> T {
        let column = self
            .column(TypeId::of::<T>())
            .expect("archetype lacks component");
        debug_assert_eq!(column.elem_size, std::mem::size_of::<T>());
        unsafe {
            std::ptr::read_unaligned(column.data.as_ptr().add(row * column.elem_size) as *const T)
        }
    }

    pub fn set<T: Component>(&mut self, row: usize, value: T) {
        let column = self
            .column_mut(TypeId::of::<T>())
            .expect("archetype lacks component");
        debug_assert_eq!(column.elem_size, std::mem::size_of::<T>());
        unsafe {
            std::ptr::write_unaligned(
                column.data.as_mut_ptr().add(row * column.elem_size) as *mut T,
                value,
            );
        }
    }
}

#[derive(Default)]
pub struct EntityRegistry {
    archetypes: Vec<Archetype>,
    index: HashMap<TypeSets, usize>,
    locations: HashMap<Entity, (usize, usize)>,
    descs: HashMap<TypeId, ComponentTypeDesc>,
    next_entity: u32,
}

/// Per-entity component payloads collected before a structural move.
#[derive(Default)]
struct PendingComponents {
    sets: TypeSets,
    values: Vec<(TypeId, Vec<u8>)>,
}

/// Deferred structural changes, applied in one batch so iteration order is
/// never invalidated mid-walk.
#[derive(Default)]
pub struct Deferred {
    additions: HashMap<Entity, PendingComponents>,
}

impl Deferred {
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) {
        let pending = self.additions.entry(entity).or_default();
        let id = TypeId::of::<T>();
        pending.sets.add_component(id);

        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        pending.values.push((id, bytes.to_vec()));
    }

    pub fn add_tag<T: Tag>(&mut self, entity: Entity) {
        self.additions
            .entry(entity)
            .or_default()
            .sets
            .add_tag(TypeId::of::<T>());
    }

    pub fn apply(self, registry: &mut EntityRegistry) {
        // Deterministic application order.
        let mut additions: Vec<(Entity, PendingComponents)> = self.additions.into_iter().collect();
        additions.sort_by_key(|(entity, _)| *entity);

        for (entity, pending) in additions {
            registry.move_entity(entity, pending);
        }
    }
}

pub struct EntityBuilder<'a> {
    registry: &'a mut EntityRegistry,
    pending: PendingComponents,
}

impl<'a> EntityBuilder<'a> {
    pub fn with<T: Component>(mut self, value: T) -> Self {
        let id = TypeId::of::<T>();
        debug_assert!(
            self.registry.descs.contains_key(&id),
            "component not registered"
        );
        self.pending.sets.add_component(id);
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.pending.values.push((id, bytes.to_vec()));
        self
    }

    pub fn with_tag<T: Tag>(mut self) -> Self {
        self.pending.sets.add_tag(TypeId::of::<T>());
        self
    }

    pub fn spawn(self) -> Entity {
        let entity = Entity(self.registry.next_entity);
        self.registry.next_entity += 1;
        self.registry.insert_into_archetype(entity, self.pending);
        entity
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_component<T: Component>(&mut self, name: &'static str) {
        self.descs.insert(
            TypeId::of::<T>(),
            ComponentTypeDesc {
                size: std::mem::size_of::<T>(),
                name,
            },
        );
    }

    pub fn component_type_desc(&self, id: TypeId) -> Option<ComponentTypeDesc> {
        self.descs.get(&id).copied()
    }

    pub fn entity(&mut self) -> EntityBuilder<'_> {
        EntityBuilder {
            registry: self,
            pending: PendingComponents::default(),
        }
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.locations.contains_key(&entity)
    }

    pub fn despawn(&mut self, entity: Entity) {
        let (archetype_index, row) = match self.locations.remove(&entity) {
            Some(location) => location,
            None => return,
        };

        let archetype = &mut self.archetypes[archetype_index];

        archetype.entities.swap_remove(row);
        for column in &mut archetype.columns {
            column.remove_swap(row);
        }

        if let Some(&moved) = archetype.entities.get(row) {
            self.locations.insert(moved, (archetype_index, row));
        }
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<T> {
        let (archetype_index, row) = *self.locations.get(&entity)?;
        let archetype = &self.archetypes[archetype_index];
        if !archetype.contains::<T>() {
            return None;
        }
        Some(archetype.get::<T>(row))
    }

    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        let (archetype_index, row) = match self.locations.get(&entity) {
            Some(location) => *location,
            None => return false,
        };
        let archetype = &mut self.archetypes[archetype_index];
        if !archetype.contains::<T>() {
            return false;
        }
        archetype.set(row, value);
        true
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetypes_mut(&mut self) -> &mut [Archetype] {
        &mut self.archetypes
    }

    /// Entities whose archetype contains every `include` component and tag
    /// and none of the `exclude` components.
    pub fn range(
        &self,
        include: &[TypeId],
        include_tags: &[TypeId],
        exclude: &[TypeId],
    ) -> Vec<Entity> {
        let mut out = Vec::new();

        for archetype in &self.archetypes {
            let matches = include.iter().all(|id| archetype.sets.contains_component(*id))
                && include_tags.iter().all(|id| archetype.sets.contains_tag(*id))
                && !exclude.iter().any(|id| archetype.sets.contains_component(*id));

            if matches {
                out.extend_from_slice(&archetype.entities);
            }
        }

        out
    }

    fn archetype_for(&mut self, sets: TypeSets) -> usize {
        if let Some(&index) = self.index.get(&sets) {
            return index;
        }

        let columns = sets
            .components
            .iter()
            .map(|id| {
                let desc = self
                    .descs
                    .get(id)
                    .expect("component used before registration");
                Column {
                    type_id: *id,
                    elem_size: desc.size,
                    data: Vec::new(),
                }
            })
            .collect();

        self.archetypes.push(Archetype {
            sets: sets.clone(),
            entities: Vec::new(),
            columns,
        });

        let index = self.archetypes.len() - 1;
        self.index.insert(sets, index);
        index
    }

    fn insert_into_archetype(&mut self, entity: Entity, pending: PendingComponents) {
        let archetype_index = self.archetype_for(pending.sets.clone());
        let archetype = &mut self.archetypes[archetype_index];

        let row = archetype.entities.len();
        archetype.entities.push(entity);

        for column in &mut archetype.columns {
            match pending.values.iter().rev().find(|(id, _)| *id == column.type_id) {
                Some((_, bytes)) => column.push_bytes(bytes),
                None => column.data.extend(std::iter::repeat(0u8).take(column.elem_size)),
            }
        }

        self.locations.insert(entity, (archetype_index, row));
    }

    fn move_entity(&mut self, entity: Entity, pending: PendingComponents) {
        let (old_index, old_row) = match self.locations.get(&entity) {
            Some(location) => *location,
            None => return,
        };

        // Merge the old sets and data with the additions.
        let mut merged = PendingComponents::default();

        {
            let archetype = &self.archetypes[old_index];
            merged.sets = archetype.sets.clone();

            for column in &archetype.columns {
                let begin = old_row * column.elem_size;
                merged
                    .values
                    .push((column.type_id, column.data[begin..begin + column.elem_size].to_vec()));
            }
        }

        for id in &pending.sets.components {
            merged.sets.add_component(*id);
        }
        for id in &pending.sets.tags {
            merged.sets.add_tag(*id);
        }
        merged.values.extend(pending.values);

        self.despawn_keep_id(entity);
        self.insert_into_archetype(entity, merged);
    }

    fn despawn_keep_id(&mut self, entity: Entity) {
        self.despawn(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Position([f32; 3]);

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Velocity([f32; 3]);

    struct Frozen;
    impl Tag for Frozen {}

    fn registry() -> EntityRegistry {
        let mut r = EntityRegistry::new();
        r.register_component::<Position>("Position");
        r.register_component::<Velocity>("Velocity");
        r
    }

    #[test]
    fn spawn_and_get() {
        let mut r = registry();
        let e = r.entity().with(Position([1.0, 2.0, 3.0])).spawn();
        assert_eq!(r.get::<Position>(e), Some(Position([1.0, 2.0, 3.0])));
        assert_eq!(r.get::<Velocity>(e), None);
    }

    #[test]
    fn deferred_moves_between_archetypes() {
        let mut r = registry();
        let e = r.entity().with(Position([0.0; 3])).spawn();

        let mut deferred = Deferred::default();
        deferred.add_component(e, Velocity([1.0, 0.0, 0.0]));
        deferred.add_tag::<Frozen>(e);
        deferred.apply(&mut r);

        // The old value survives the move and the new components landed.
        assert_eq!(r.get::<Position>(e), Some(Position([0.0; 3])));
        assert_eq!(r.get::<Velocity>(e), Some(Velocity([1.0, 0.0, 0.0])));

        let matches = r.range(
            &[TypeId::of::<Position>(), TypeId::of::<Velocity>()],
            &[TypeId::of::<Frozen>()],
            &[],
        );
        assert_eq!(matches, vec![e]);
    }

    #[test]
    fn exclusion_filters_archetypes() {
        let mut r = registry();
        let a = r.entity().with(Position([0.0; 3])).spawn();
        let _b = r
            .entity()
            .with(Position([0.0; 3]))
            .with(Velocity([0.0; 3]))
            .spawn();

        let only_positions = r.range(&[TypeId::of::<Position>()], &[], &[TypeId::of::<Velocity>()]);
        assert_eq!(only_positions, vec![a]);
    }

    #[test]
    fn column_bytes_match_component_layout() {
        let mut r = registry();
        r.entity().with(Position([1.0, 2.0, 3.0])).spawn();

        let archetype = &r.archetypes()[0];
        let bytes = archetype.column_bytes(TypeId::of::<Position>()).unwrap();
        assert_eq!(bytes.len(), std::mem::size_of::<Position>());
    }
}
