use memtrack::{CallSite, TrackedAlloc, TrackingAllocator};
use std::alloc::{GlobalAlloc, Layout, System};
use std::error::Error;

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator::new();

#[memtrack::check]
fn balanced() {
    let value = memtrack::new!(1u8);
    let values = memtrack::new_array![0u32; 8];
    unsafe {
        memtrack::delete(value);
        memtrack::delete_array(values);
    }
}

fn func1() {
    let _leak1 = memtrack::new!(5i32);
    let _leak2 = memtrack::new_array![0i32; 10];

    let no_leak1 = memtrack::new!(10i32);
    unsafe { memtrack::delete(no_leak1) };

    let no_leak2 = memtrack::new_array![0i32; 10];
    unsafe { memtrack::delete_array(no_leak2) };
}

fn func2(x: i32) -> i32 {
    let leak1 = memtrack::new!(5i32);

    let no_leak2 = memtrack::new_array![0i32; 10];
    unsafe { memtrack::delete_array(no_leak2) };

    unsafe { *leak1.as_ref() + x }
}

fn func3(x: i32, _label: &str) {
    let _leak1 = memtrack::new!(5 + x);

    let greeting = memtrack::new!(String::from("Hello"));
    unsafe { memtrack::delete(greeting) };

    let _leak2 = memtrack::new!(String::from("Hello World!"));
}

fn func4(_x: i32, _b: bool, _y: f32, z: f64, _label: &str) -> Result<(), Box<dyn Error>> {
    let _leak1 = memtrack::new!(5.25 + z);

    // Array allocation released through the scalar path: reported, still freed.
    let layout = Layout::array::<f64>(5)?;
    let tracker = memtrack::interceptor();
    let block = tracker.allocate_array(layout, CallSite::new(file!(), line!()))?;
    unsafe { tracker.deallocate(block.as_ptr(), layout) };

    Ok(())
}

#[memtrack::track]
fn build_index(words: &[&str]) -> Vec<String> {
    words.iter().map(|word| word.to_uppercase()).collect()
}

#[derive(TrackedAlloc, Clone)]
struct Sample {
    id: u32,
    value: f64,
}

fn main() -> Result<(), Box<dyn Error>> {
    memtrack::init();

    println!("\nChecking a function that releases everything..");
    balanced();

    println!("\nTesting functions (func1, func2, func3 and func4)..");
    memtrack::check(func1);
    let result = memtrack::check(|| func2(5));
    println!("func2 returned {result}");
    memtrack::check(|| func3(3, "Hello"));
    memtrack::check(|| func4(5, true, 2.5, 3.8, "Hello"))?;

    println!("\nTracking a function through the global allocator..");
    let index = build_index(&["alpha", "beta"]);
    println!("built {} entries", index.len());
    std::mem::forget(index);

    let sample = Sample::tracked_new(Sample { id: 1, value: 0.5 });
    let kept = unsafe { sample.as_ref() };
    println!("sample {} holds {}", kept.id, kept.value);
    let batch = Sample::tracked_new_array(Sample { id: 2, value: 1.5 }, 3);
    unsafe { Sample::tracked_delete_array(batch) };

    println!("\nReleasing a block the tracker never saw..");
    let layout = Layout::new::<u64>();
    let foreign = unsafe { System.alloc(layout) };
    let outcome = unsafe { memtrack::interceptor().deallocate(foreign, layout) };
    println!("foreign release: {outcome:?}");

    println!("\nReporting at a point..");
    memtrack::report();

    Ok(())
}
