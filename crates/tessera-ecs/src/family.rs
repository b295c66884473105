//! Parent/child relationships between entities.
//!
//! Relations live in a flat arena indexed by entity index. Every slot
//! remembers which entity (with generation) it describes, so a recycled index
//! never inherits a previous owner's relations. [`Families::adopt`] walks the
//! ancestor chain before mutating, which keeps the graph acyclic.

use crate::entity::Entity;
use parking_lot::RwLock;
use std::fmt;

#[derive(Debug, Clone, Default)]
struct Relation {
    entity: Entity,
    parent: Option<Entity>,
    children: Vec<Entity>,
}

#[derive(Default)]
pub struct Families {
    relations: RwLock<Vec<Relation>>,
}

fn relation(relations: &[Relation], entity: Entity) -> Option<&Relation> {
    relations
        .get(entity.index() as usize)
        .filter(|relation| relation.entity == entity)
}

fn relation_mut(relations: &mut Vec<Relation>, entity: Entity) -> &mut Relation {
    let index = entity.index() as usize;
    if index >= relations.len() {
        relations.resize_with(index + 1, Relation::default);
    }
    let relation = &mut relations[index];
    if relation.entity != entity {
        *relation = Relation {
            entity,
            ..Relation::default()
        };
    }
    relation
}

fn parent_of(relations: &[Relation], entity: Entity) -> Option<Entity> {
    relation(relations, entity).and_then(|relation| relation.parent)
}

impl Families {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `child` a child of `parent`, detaching it from any previous
    /// parent. Fails on self-adoption, on an existing identical relation, and
    /// when `child` is an ancestor of `parent`.
    pub fn adopt(&self, parent: Entity, child: Entity) -> bool {
        if parent == child {
            return false;
        }
        let mut relations = self.relations.write();
        if parent_of(&relations, child) == Some(parent) {
            return false;
        }
        let mut current = Some(parent);
        while let Some(ancestor) = current {
            if ancestor == child {
                return false;
            }
            current = parent_of(&relations, ancestor);
        }

        if let Some(previous) = parent_of(&relations, child) {
            relation_mut(&mut relations, previous)
                .children
                .retain(|&sibling| sibling != child);
        }
        relation_mut(&mut relations, child).parent = Some(parent);
        relation_mut(&mut relations, parent).children.push(child);
        true
    }

    /// Detach `child` from its parent. Returns the former parent.
    pub fn reject(&self, child: Entity) -> Option<Entity> {
        let mut relations = self.relations.write();
        let parent = parent_of(&relations, child)?;
        relation_mut(&mut relations, parent)
            .children
            .retain(|&sibling| sibling != child);
        relation_mut(&mut relations, child).parent = None;
        Some(parent)
    }

    pub fn parent(&self, child: Entity) -> Option<Entity> {
        parent_of(&self.relations.read(), child)
    }

    pub fn children(&self, parent: Entity) -> Vec<Entity> {
        relation(&self.relations.read(), parent)
            .map(|relation| relation.children.clone())
            .unwrap_or_default()
    }

    /// Parent first, root last.
    pub fn ancestors(&self, entity: Entity) -> Vec<Entity> {
        let relations = self.relations.read();
        let mut ancestors = Vec::new();
        let mut current = parent_of(&relations, entity);
        while let Some(ancestor) = current {
            ancestors.push(ancestor);
            current = parent_of(&relations, ancestor);
        }
        ancestors
    }

    /// Depth-first, pre-order.
    pub fn descendants(&self, entity: Entity) -> Vec<Entity> {
        let relations = self.relations.read();
        let mut descendants = Vec::new();
        let mut stack: Vec<Entity> = relation(&relations, entity)
            .map(|relation| relation.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            descendants.push(next);
            if let Some(relation) = relation(&relations, next) {
                stack.extend(relation.children.iter().rev());
            }
        }
        descendants
    }

    /// Topmost ancestor, or `entity` itself when it has no parent.
    pub fn root(&self, entity: Entity) -> Entity {
        self.ancestors(entity).last().copied().unwrap_or(entity)
    }

    /// Forget `entity`: detach it from its parent and orphan its children.
    /// Returns the former parent and children.
    pub fn clear(&self, entity: Entity) -> (Option<Entity>, Vec<Entity>) {
        let mut relations = self.relations.write();
        let Some(existing) = relation(&relations, entity).cloned() else {
            return (None, Vec::new());
        };
        if let Some(parent) = existing.parent {
            relation_mut(&mut relations, parent)
                .children
                .retain(|&sibling| sibling != entity);
        }
        for &child in &existing.children {
            relation_mut(&mut relations, child).parent = None;
        }
        relations[entity.index() as usize] = Relation::default();
        (existing.parent, existing.children)
    }
}

impl fmt::Debug for Families {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relations = self.relations.read();
        let linked = relations.iter().filter(|r| r.parent.is_some()).count();
        f.debug_struct("Families").field("linked", &linked).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> Entity {
        Entity::new(index, 1)
    }

    #[test]
    fn adopt_builds_tree() {
        let families = Families::new();
        assert!(families.adopt(e(0), e(1)));
        assert!(families.adopt(e(0), e(2)));
        assert!(families.adopt(e(1), e(3)));
        assert!(!families.adopt(e(0), e(1)));

        assert_eq!(families.parent(e(3)), Some(e(1)));
        assert_eq!(families.children(e(0)), vec![e(1), e(2)]);
        assert_eq!(families.ancestors(e(3)), vec![e(1), e(0)]);
        assert_eq!(families.descendants(e(0)), vec![e(1), e(3), e(2)]);
        assert_eq!(families.root(e(3)), e(0));
        assert_eq!(families.root(e(0)), e(0));
    }

    #[test]
    fn adopt_rejects_cycles() {
        let families = Families::new();
        assert!(!families.adopt(e(0), e(0)));
        assert!(families.adopt(e(0), e(1)));
        assert!(families.adopt(e(1), e(2)));
        assert!(!families.adopt(e(2), e(0)));
        assert!(!families.adopt(e(1), e(0)));
        assert_eq!(families.parent(e(0)), None);
    }

    #[test]
    fn adopt_moves_between_parents() {
        let families = Families::new();
        families.adopt(e(0), e(2));
        families.adopt(e(1), e(2));
        assert_eq!(families.children(e(0)), Vec::<Entity>::new());
        assert_eq!(families.children(e(1)), vec![e(2)]);
        assert_eq!(families.reject(e(2)), Some(e(1)));
        assert_eq!(families.reject(e(2)), None);
    }

    #[test]
    fn clear_orphans_children_and_ignores_recycled_indices() {
        let families = Families::new();
        families.adopt(e(0), e(1));
        families.adopt(e(1), e(2));
        let (parent, children) = families.clear(e(1));
        assert_eq!(parent, Some(e(0)));
        assert_eq!(children, vec![e(2)]);
        assert_eq!(families.parent(e(2)), None);
        assert!(families.children(e(0)).is_empty());

        families.adopt(e(3), e(4));
        let recycled = Entity::new(4, 2);
        assert_eq!(families.parent(recycled), None);
    }
}
