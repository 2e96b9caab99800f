/// Integration tests for user classes and self-referring calls.
use cantus::Evaluator;

fn eval(src: &str) -> String {
    Evaluator::new().eval(src).expect("script should evaluate")
}

#[test]
fn test_class_with_inheritance_scenario() {
    let src = "\
class pet
    name = \"\"
    function init(n)
        this.name = n
class cat : pet
    function speak()
        return \"meow\"
c = cat(\"alex\")
return c.speak() + \",\" + c.name";
    assert_eq!(eval(src), "meow,alex");
}

#[test]
fn test_field_defaults_are_per_instance() {
    let src = "\
class counter
    value = 0
a = counter()
b = counter()
a.value = 10
return a.value + b.value";
    assert_eq!(eval(src), "10");
}

#[test]
fn test_methods_mutate_through_this() {
    let src = "\
class tally
    total = 0
    function bump(amount)
        this.total += amount
t = tally()
t.bump(3)
t.bump(4)
return t.total";
    assert_eq!(eval(src), "7");
}

#[test]
fn test_constructor_skipped_for_empty_arguments() {
    // `init` requires a parameter, so a bare call builds an
    // uninitialized instance instead of failing.
    let src = "\
class point
    x = 0
    function init(x0)
        this.x = x0
p = point()
return p.x";
    assert_eq!(eval(src), "0");
}

#[test]
fn test_type_field_reports_class_name() {
    let src = "\
class widget
    size = 1
w = widget()
return w.type()";
    assert_eq!(eval(src), "widget");
}

#[test]
fn test_multiple_inheritance_leftmost_base_wins() {
    let src = "\
class left
    function speak()
        return \"left\"
class right
    function speak()
        return \"right\"
class both : left, right
    x = 1
b = both()
return b.speak()";
    assert_eq!(eval(src), "left");
}

#[test]
fn test_subclass_overrides_base_method() {
    let src = "\
class animal
    function speak()
        return \"...\"
class dog : animal
    function speak()
        return \"woof\"
d = dog()
return d.speak()";
    assert_eq!(eval(src), "woof");
}

#[test]
fn test_static_members_stay_in_the_namespace() {
    let src = "\
class geometry
    static function area(w, h)
        return w * h
return geometry.area(3, 4)";
    assert_eq!(eval(src), "12");
}

#[test]
fn test_self_referring_sort_mutates_receiver() {
    let src = "\
let lst = [3, 1, 2]
lst.sort()
return lst";
    assert_eq!(eval(src), "[1, 2, 3]");
}

#[test]
fn test_self_referring_call_on_literal() {
    let src = "return [3, 1, 2].sort()";
    assert_eq!(eval(src), "[1, 2, 3]");
}

#[test]
fn test_instances_share_through_references() {
    let src = "\
class box
    content = \"empty\"
a = box()
b = a
b.content = \"full\"
return a.content";
    assert_eq!(eval(src), "full");
}

#[test]
fn test_instance_field_walks_nest() {
    let src = "\
class wheel
    spokes = 32
class bike
    front = 0
    function init()
        this.front = wheel()
b = bike()
return b.front.spokes";
    assert_eq!(eval(src), "32");
}

#[test]
fn test_serialized_instances_reload() {
    let ev = Evaluator::new();
    ev.eval(
        "\
class pet
    name = \"\"
p = pet()
p.name = \"rex\"",
    )
    .unwrap();
    let script = ev.serialize();
    let fresh = Evaluator::new();
    fresh.eval(&script).expect("state should reload");
    assert_eq!(fresh.eval_expr("p.name", true, false).unwrap(), "rex");
}
